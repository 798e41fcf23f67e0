#[cfg(test)]
mod tests {
    use crate::codec::{DefaultCodec, Frame, FrameCodec};
    use crate::frame::{read_raw_frame, write_raw_frame, FrameHeader, OpCode, ProtocolVersion, RawFrame};
    use crate::messages::{ErrorMessage, Message, ResultMessage, ERROR_AUTHENTICATION};
    use bytes::Bytes;
    use cloudgate_core::CloudgateError;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn reads_startup_frame_from_stream() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let mut buf = Vec::new();
        buf.extend_from_slice(&[0x04, 0x00, 0x00, 0x07, 0x01]);
        let body = b"\x00\x01\x00\x0bCQL_VERSION\x00\x053.0.0";
        buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(body);
        client.write_all(&buf).await.expect("write");

        let raw = read_raw_frame(&mut server).await.expect("read").expect("frame");
        assert_eq!(raw.header.version, ProtocolVersion::V4);
        assert!(!raw.header.is_response);
        assert_eq!(raw.stream_id(), 7);
        assert_eq!(raw.opcode(), OpCode::Startup);

        let frame = DefaultCodec.decode(&raw).expect("decode");
        match frame.message {
            Message::Startup { options } => {
                assert_eq!(options, vec![("CQL_VERSION".to_string(), "3.0.0".to_string())]);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn written_frame_reads_back_identically() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let raw = DefaultCodec
            .encode(&Frame::response(
                ProtocolVersion::V4,
                -1,
                Message::AuthChallenge {
                    token: Some(Bytes::from_static(b"PLAIN-START")),
                },
            ))
            .expect("encode");
        write_raw_frame(&mut server, &raw).await.expect("write");
        drop(server);
        let read = read_raw_frame(&mut client).await.expect("read").expect("frame");
        assert_eq!(read, raw);
        assert!(read.header.is_response);
        assert!(read_raw_frame(&mut client).await.expect("eof").is_none());
    }

    #[tokio::test]
    async fn unsupported_version_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&[0x05, 0x00, 0x00, 0x01, 0x05, 0, 0, 0, 0])
            .await
            .expect("write");
        let err = read_raw_frame(&mut server).await.expect_err("v5 header");
        match err.downcast_ref::<CloudgateError>() {
            Some(CloudgateError::UnsupportedVersion { version, stream_id }) => {
                assert_eq!(*version, 5);
                assert_eq!(*stream_id, 1);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn oversized_values_fail_to_encode() {
        let id = vec![0u8; u16::MAX as usize + 1];
        assert!(ErrorMessage::unprepared("too long", &id).is_err());

        let frame = Frame::request(
            ProtocolVersion::V4,
            1,
            Message::Execute {
                id: Bytes::from(id),
                parameters: Bytes::new(),
            },
        );
        assert!(DefaultCodec.encode(&frame).is_err());

        let startup = Frame::request(
            ProtocolVersion::V4,
            1,
            Message::Startup {
                options: vec![("USER".into(), "u".repeat(70_000))],
            },
        );
        assert!(DefaultCodec.encode(&startup).is_err());
    }

    #[test]
    fn authentication_error_is_recognised() {
        let raw = DefaultCodec
            .encode(&Frame::response(
                ProtocolVersion::V4,
                0,
                Message::Error(ErrorMessage::new(ERROR_AUTHENTICATION, "bad credentials")),
            ))
            .expect("encode");
        let frame = DefaultCodec.decode(&raw).expect("decode");
        match frame.message {
            Message::Error(err) => {
                assert!(err.is_authentication_error());
                assert_eq!(err.message, "bad credentials");
                assert!(err.unprepared_id().is_none());
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn unprepared_error_exposes_id() {
        let raw = DefaultCodec
            .encode(&Frame::response(
                ProtocolVersion::V4,
                3,
                Message::Error(ErrorMessage::unprepared("unknown id", &[1, 2, 3]).expect("unprepared")),
            ))
            .expect("encode");
        match DefaultCodec.decode(&raw).expect("decode").message {
            Message::Error(err) => assert_eq!(err.unprepared_id().as_deref(), Some(&[1u8, 2, 3][..])),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn prepared_result_keeps_metadata_bytes() {
        let mut body = Vec::new();
        body.extend_from_slice(&4i32.to_be_bytes());
        body.extend_from_slice(&2u16.to_be_bytes());
        body.extend_from_slice(&[0xab, 0xcd]);
        body.extend_from_slice(b"metadata");
        let raw = RawFrame::new(
            FrameHeader::response(ProtocolVersion::V4, 9, OpCode::Result),
            Bytes::from(body.clone()),
        );
        let frame = DefaultCodec.decode(&raw).expect("decode");
        assert_eq!(
            frame.message,
            Message::Result(ResultMessage::Prepared {
                id: Bytes::from_static(&[0xab, 0xcd]),
                metadata: Bytes::from_static(b"metadata"),
            })
        );
        assert_eq!(frame.message.encode().expect("encode").as_ref(), body.as_slice());
    }

    #[test]
    fn execute_id_can_be_replaced() {
        let mut body = Vec::new();
        body.extend_from_slice(&3u16.to_be_bytes());
        body.extend_from_slice(b"old");
        body.extend_from_slice(&[0x00, 0x01, 0x00]);
        let raw = RawFrame::new(
            FrameHeader::request(ProtocolVersion::V4, 5, OpCode::Execute),
            Bytes::from(body),
        );
        let mut frame = DefaultCodec.decode(&raw).expect("decode");
        if let Message::Execute { id, .. } = &mut frame.message {
            *id = Bytes::from_static(b"replacement");
        }
        let encoded = DefaultCodec.encode(&frame).expect("encode");
        let mut expected = Vec::new();
        expected.extend_from_slice(&11u16.to_be_bytes());
        expected.extend_from_slice(b"replacement");
        expected.extend_from_slice(&[0x00, 0x01, 0x00]);
        assert_eq!(encoded.body.as_ref(), expected.as_slice());
        assert_eq!(encoded.stream_id(), 5);
    }

    #[test]
    fn truncated_body_fails_to_decode() {
        let raw = RawFrame::new(
            FrameHeader::response(ProtocolVersion::V4, 0, OpCode::Authenticate),
            Bytes::from_static(&[0x00, 0x10, b'a']),
        );
        assert!(DefaultCodec.decode(&raw).is_err());
    }

    #[test]
    fn unknown_opcode_body_stays_raw() {
        let raw = RawFrame::new(
            FrameHeader::response(ProtocolVersion::V3, 1, OpCode::Supported),
            Bytes::from_static(b"\x00\x00"),
        );
        let frame = DefaultCodec.decode(&raw).expect("decode");
        assert_eq!(
            frame.message,
            Message::Other {
                opcode: OpCode::Supported,
                body: Bytes::from_static(b"\x00\x00"),
            }
        );
    }
}
