pub mod error;
pub mod pscache;
pub mod types;

pub use error::CloudgateError;
pub use pscache::{PreparedEntry, PreparedStatementCache};
pub use types::{ClusterType, ForwardDecision, PreparedStatementInfo};
