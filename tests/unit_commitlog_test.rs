use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tempfile::TempDir;
use tesseradb::core::TesseraError;
use tesseradb::core::commitlog::block::{
    BlockHeader, COMPRESSION_NONE, HEADER_LENGTH, LEGACY_HEADER_LENGTH, MAGIC_DATA, MAGIC_DATA_V1,
};
use tesseradb::core::commitlog::reader::{BlockStream, list_fragment_ids};
use tesseradb::core::commitlog::{
    BlockKind, CommitLogReader, CommitLogWriter, fletcher32, fragment_path,
};
use tesseradb::core::dfs::{Dfs, LocalDfs};

fn local_dfs(dir: &TempDir) -> Arc<dyn Dfs> {
    Arc::new(LocalDfs::new(dir.path()))
}

#[tokio::test]
async fn write_then_scan_roundtrip() {
    let dir = TempDir::new().unwrap();
    let dfs = local_dfs(&dir);

    let writer = CommitLogWriter::open(dfs.clone(), "/log/user", 9, true)
        .await
        .unwrap();
    writer.write(b"first payload", 100).await.unwrap();
    writer.write(b"second payload", 101).await.unwrap();
    writer.close().await.unwrap();

    let mut reader = CommitLogReader::open(dfs.clone(), "/log/user").await.unwrap();
    let block = reader.next().await.unwrap().unwrap();
    assert_eq!(&block.payload[..], b"first payload");
    assert_eq!(block.header.revision, 100);
    assert_eq!(block.header.cluster_id, 9);

    let block = reader.next().await.unwrap().unwrap();
    assert_eq!(&block.payload[..], b"second payload");
    assert!(reader.next().await.unwrap().is_none());
    assert_eq!(reader.latest_revision(), Some(101));
}

#[tokio::test]
async fn zero_length_fragment_is_skipped() {
    let dir = TempDir::new().unwrap();
    let dfs = local_dfs(&dir);

    // Fragment 0 is empty (crash before the first append), fragment 1 has data.
    dfs.append(&fragment_path("/log/user", 0), Bytes::new())
        .await
        .unwrap();
    let writer = CommitLogWriter::open(dfs.clone(), "/log/user", 1, false)
        .await
        .unwrap();
    writer.write(b"data", 5).await.unwrap();

    let mut reader = CommitLogReader::open(dfs, "/log/user").await.unwrap();
    let block = reader.next().await.unwrap().unwrap();
    assert_eq!(&block.payload[..], b"data");
    assert!(reader.next().await.unwrap().is_none());
}

#[tokio::test]
async fn truncated_trailing_block_is_clean_end_of_stream() {
    let dir = TempDir::new().unwrap();
    let dfs = local_dfs(&dir);

    let writer = CommitLogWriter::open(dfs.clone(), "/log/user", 1, false)
        .await
        .unwrap();
    writer.write(b"complete block", 1).await.unwrap();
    writer.write(b"this block will be cut", 2).await.unwrap();
    writer.sync().await.unwrap();

    // Cut the file inside the second block's payload.
    let path = fragment_path("/log/user", 0);
    let data = dfs.read(&path).await.unwrap();
    dfs.remove(&path).await.unwrap();
    dfs.append(&path, data.slice(0..data.len() - 10)).await.unwrap();

    let mut stream = BlockStream::open(&dfs, &path).await.unwrap();
    let first = stream.next().unwrap().unwrap();
    assert_eq!(&first.payload[..], b"complete block");
    assert!(stream.next().unwrap().is_none());

    // Truncation inside the trailing header is equally clean.
    let data = dfs.read(&path).await.unwrap();
    dfs.remove(&path).await.unwrap();
    let first_len = HEADER_LENGTH + b"complete block".len();
    dfs.append(&path, data.slice(0..first_len + 5)).await.unwrap();
    let mut stream = BlockStream::open(&dfs, &path).await.unwrap();
    stream.next().unwrap().unwrap();
    assert!(stream.next().unwrap().is_none());
}

#[tokio::test]
async fn corrupted_header_and_payload_are_detected() {
    let dir = TempDir::new().unwrap();
    let dfs = local_dfs(&dir);

    let writer = CommitLogWriter::open(dfs.clone(), "/log/user", 1, false)
        .await
        .unwrap();
    writer.write(b"some payload bytes", 1).await.unwrap();
    let path = fragment_path("/log/user", 0);

    // Flip a byte inside the header.
    let mut data = dfs.read(&path).await.unwrap().to_vec();
    data[12] ^= 0xff;
    dfs.remove(&path).await.unwrap();
    dfs.append(&path, Bytes::from(data.clone())).await.unwrap();
    let mut stream = BlockStream::open(&dfs, &path).await.unwrap();
    assert!(matches!(
        stream.next(),
        Err(TesseraError::CorruptCommitLog(_))
    ));

    // Flip a byte inside the payload instead.
    data[12] ^= 0xff;
    data[HEADER_LENGTH + 3] ^= 0xff;
    dfs.remove(&path).await.unwrap();
    dfs.append(&path, Bytes::from(data)).await.unwrap();
    let mut stream = BlockStream::open(&dfs, &path).await.unwrap();
    assert!(matches!(
        stream.next(),
        Err(TesseraError::CorruptCommitLog(_))
    ));
}

#[tokio::test]
async fn link_blocks_accumulate_and_are_followed() {
    let dir = TempDir::new().unwrap();
    let dfs = local_dfs(&dir);

    // A transfer log with one block.
    let transfer = CommitLogWriter::open(dfs.clone(), "/log/transfer-1", 1, false)
        .await
        .unwrap();
    transfer.write(b"transferred", 7).await.unwrap();
    transfer.close().await.unwrap();

    // The main log links it in between two blocks of its own.
    let writer = CommitLogWriter::open(dfs.clone(), "/log/user", 1, false)
        .await
        .unwrap();
    writer.write(b"before", 1).await.unwrap();
    writer.link_log("/log/transfer-1", 2).await.unwrap();
    writer.write(b"after", 3).await.unwrap();
    writer.close().await.unwrap();

    let mut reader = CommitLogReader::open(dfs, "/log/user").await.unwrap();
    let mut payloads = Vec::new();
    while let Some(block) = reader.next().await.unwrap() {
        assert_eq!(block.kind, BlockKind::Data);
        payloads.push(block.payload.to_vec());
    }
    assert!(payloads.contains(&b"before".to_vec()));
    assert!(payloads.contains(&b"after".to_vec()));
    assert!(payloads.contains(&b"transferred".to_vec()));
    assert_eq!(reader.linked_logs(), &["/log/transfer-1".to_string()]);
}

#[tokio::test]
async fn legacy_fragment_defaults_cluster_id_to_zero() {
    let dir = TempDir::new().unwrap();
    let dfs = local_dfs(&dir);

    // Hand-roll a legacy block: 34-byte header (no cluster id), magic suffix '1'.
    let payload = b"legacy payload";
    let mut buf = BytesMut::new();
    buf.put_slice(MAGIC_DATA_V1);
    buf.put_u8(LEGACY_HEADER_LENGTH as u8);
    buf.put_u8(COMPRESSION_NONE);
    buf.put_u32_le(fletcher32(payload));
    buf.put_u32_le(payload.len() as u32);
    buf.put_u32_le(payload.len() as u32);
    buf.put_i64_le(42);
    let checksum = fletcher32(&buf[..]);
    buf.put_u16_le((checksum & 0xffff) as u16);
    buf.put_slice(payload);

    let path = fragment_path("/log/user", 0);
    dfs.append(&path, buf.freeze()).await.unwrap();

    let mut stream = BlockStream::open(&dfs, &path).await.unwrap();
    let block = stream.next().unwrap().unwrap();
    assert!(block.header.is_legacy());
    assert_eq!(block.header.cluster_id, 0);
    assert_eq!(block.header.revision, 42);
    assert_eq!(&block.payload[..], payload);
}

#[tokio::test]
async fn fragment_listing_skips_markers_and_purged() {
    let dir = TempDir::new().unwrap();
    let dfs = local_dfs(&dir);

    for name in [
        "0000000001",
        "0000000002",
        "0000000002.mark",
        "0000000003.purged",
        "purged-directory",
        "0000000004.tmp",
    ] {
        dfs.append(&format!("/log/user/{name}"), Bytes::from_static(b"x"))
            .await
            .unwrap();
    }
    let ids = list_fragment_ids(&dfs, "/log/user").await.unwrap();
    assert_eq!(ids, vec![1, 2]);
}

#[tokio::test]
async fn roll_closes_fragment_with_eof_and_mark() {
    let dir = TempDir::new().unwrap();
    let dfs = local_dfs(&dir);

    let writer = CommitLogWriter::open(dfs.clone(), "/log/user", 1, false)
        .await
        .unwrap();
    writer.write(b"one", 1).await.unwrap();
    let next = writer.roll().await.unwrap();
    assert_eq!(next, 1);
    writer.write(b"two", 2).await.unwrap();

    assert!(
        dfs.exists(&format!("{}.mark", fragment_path("/log/user", 0)))
            .await
            .unwrap()
    );

    let path = fragment_path("/log/user", 0);
    let mut stream = BlockStream::open(&dfs, &path).await.unwrap();
    assert_eq!(stream.next().unwrap().unwrap().kind, BlockKind::Data);
    assert_eq!(stream.next().unwrap().unwrap().kind, BlockKind::Eof);

    // A header decoded from scratch still verifies after zstd-less roundtrip.
    let header = BlockHeader::new(MAGIC_DATA, 5, 3);
    assert_eq!(header.encoded_length(), HEADER_LENGTH);
}
