use bytes::BytesMut;
use proptest::prelude::*;

use periscope_http::{copy_body, BodyKind, BufferedReader, BufferedWriter, ByteBufferPool, NopSniffer};

fn encode_chunked(chunks: &[Vec<u8>], extension: Option<&str>) -> Vec<u8> {
    let mut wire = Vec::new();
    for chunk in chunks {
        match extension {
            Some(ext) => wire.extend_from_slice(format!("{:x};{ext}\r\n", chunk.len()).as_bytes()),
            None => wire.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes()),
        }
        wire.extend_from_slice(chunk);
        wire.extend_from_slice(b"\r\n");
    }
    wire.extend_from_slice(b"0\r\n\r\n");
    wire
}

async fn relay(wire: &[u8]) -> Result<Vec<u8>, periscope_http::ParseError> {
    let pool = ByteBufferPool::new(256);
    let mut reader = BufferedReader::new(wire, pool.acquire(), std::time::Duration::from_secs(5));
    let mut sink = Vec::new();
    {
        let mut writer =
            BufferedWriter::new(&mut sink, pool.acquire(), std::time::Duration::from_secs(5));
        let mut scratch = BytesMut::new();
        copy_body(
            &mut reader,
            &mut writer,
            BodyKind::Chunked,
            &mut scratch,
            &NopSniffer,
        )
        .await?;
        writer.flush().await.expect("flush");
    }
    Ok(sink)
}

proptest! {
    #[test]
    fn chunked_bodies_round_trip_byte_identical(
        chunks in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 1..512),
            0..8,
        ),
        with_extension in any::<bool>(),
    ) {
        let extension = with_extension.then_some("name=value");
        let wire = encode_chunked(&chunks, extension);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");
        let relayed = runtime.block_on(relay(&wire)).expect("relay");
        prop_assert_eq!(relayed, wire);
    }

    #[test]
    fn junk_chunk_size_lines_never_panic(line in "[ -~]{0,64}") {
        let mut wire = Vec::new();
        wire.extend_from_slice(line.as_bytes());
        wire.extend_from_slice(b"\r\nrest");
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");
        let _ = runtime.block_on(relay(&wire));
    }
}
