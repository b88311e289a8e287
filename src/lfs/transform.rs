//! Clean and smudge transforms.

use crate::error::Result;
use crate::filter::protocol::ContentWriter;
use crate::filter::scanner::Payload;
use crate::filter::status::TurnOutcome;
use crate::lfs::path_filter::PathFilter;
use crate::lfs::pointer::{Pointer, BLOB_SIZE_CUTOFF};
use crate::lfs::store::{LocalStore, COPY_BUFFER_SIZE};
use crate::transfer::source::{fetch_with_retries, RetryPolicy, SharedSource};
use bytes::BytesMut;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

/// Everything smudge needs besides the request itself.
#[derive(Clone)]
pub struct SmudgeContext {
    pub store: LocalStore,
    pub source: SharedSource,
    /// Leave pointers in the working tree.
    pub skip: bool,
    pub filter: PathFilter,
    pub retry: RetryPolicy,
}

impl SmudgeContext {
    /// Whether `pathname` gets real content rather than its pointer text.
    pub fn should_materialize(&self, pathname: &str) -> bool {
        !self.skip && self.filter.allows(pathname)
    }
}

/// Result of sniffing the start of a smudge payload.
#[derive(Debug)]
pub enum Decoded {
    Pointer(Pointer),
    /// Bytes already consumed from the payload; the rest is still unread.
    NotAPointer(BytesMut),
    Empty,
}

pub async fn decode_from<R: AsyncRead + Unpin>(payload: &mut Payload<'_, R>) -> Result<Decoded> {
    let head = payload.read_head(BLOB_SIZE_CUTOFF).await?;
    if head.complete {
        if head.data.is_empty() {
            return Ok(Decoded::Empty);
        }
        if let Ok(pointer) = Pointer::decode(&head.data) {
            return Ok(Decoded::Pointer(pointer));
        }
    }
    Ok(Decoded::NotAPointer(head.data))
}

/// Turn working-tree content into a pointer, storing the content locally.
///
/// Content that already is a pointer is written back in canonical form.
/// `size_hint` is the expected content size when Git knows it.
pub async fn clean<R, W>(
    payload: &mut Payload<'_, R>,
    out: &mut ContentWriter<'_, W>,
    pathname: &str,
    store: &LocalStore,
    size_hint: Option<u64>,
) -> Result<TurnOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let head = payload.read_head(BLOB_SIZE_CUTOFF).await?;
    if head.complete && head.data.is_empty() {
        // Empty files stay empty, there is nothing to store.
        return Ok(end_of(payload, TurnOutcome::Ok));
    }
    if head.complete {
        if let Ok(pointer) = Pointer::decode(&head.data) {
            tracing::debug!(pathname, oid = %pointer.oid, "clean input is already a pointer");
            out.write(pointer.encode().as_bytes()).await?;
            return Ok(end_of(payload, TurnOutcome::Ok));
        }
    }

    let mut staged = store.stage().await?;
    staged.write(&head.data).await?;
    while let Some(chunk) = payload.next_chunk().await? {
        staged.write(&chunk).await?;
    }
    let pointer = staged.commit(store).await?;

    if let Some(expected) = size_hint.filter(|s| *s != pointer.size) {
        tracing::debug!(pathname, expected, actual = pointer.size, "clean size differs from hint");
    }
    tracing::debug!(pathname, oid = %pointer.oid, size = pointer.size, "cleaned");

    out.write(pointer.encode().as_bytes()).await?;
    Ok(end_of(payload, TurnOutcome::Ok))
}

/// Turn a pointer back into content.
pub async fn smudge<R, W>(
    payload: &mut Payload<'_, R>,
    out: &mut ContentWriter<'_, W>,
    pathname: &str,
    ctx: &SmudgeContext,
) -> Result<TurnOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let decoded = decode_from(payload).await?;
    smudge_decoded(decoded, payload, out, pathname, ctx).await
}

/// Smudge with the payload head already decoded.
pub async fn smudge_decoded<R, W>(
    decoded: Decoded,
    payload: &mut Payload<'_, R>,
    out: &mut ContentWriter<'_, W>,
    pathname: &str,
    ctx: &SmudgeContext,
) -> Result<TurnOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let pointer = match decoded {
        Decoded::Pointer(pointer) => pointer,
        Decoded::Empty => return Ok(end_of(payload, TurnOutcome::Ok)),
        Decoded::NotAPointer(head) => {
            out.write(&head).await?;
            while let Some(chunk) = payload.next_chunk().await? {
                out.write(&chunk).await?;
            }
            return Ok(TurnOutcome::PassthroughNotAPointer);
        }
    };

    if !ctx.should_materialize(pathname) {
        tracing::debug!(pathname, skip = ctx.skip, "leaving pointer in place");
        out.write(pointer.encode().as_bytes()).await?;
        return Ok(end_of(payload, TurnOutcome::Ok));
    }

    let path = ctx.store.local_media_path(&pointer.oid).await?;
    fetch_with_retries(
        ctx.source.as_ref(),
        &pointer.oid,
        pointer.size,
        &path,
        &ctx.store.tmp_dir(),
        ctx.retry,
    )
    .await?;
    let mut file = File::open(&path).await?;
    copy_object(&mut file, out).await?;
    Ok(end_of(payload, TurnOutcome::Ok))
}

/// Copy an opened object file into `out`. Returns the bytes copied.
pub async fn copy_object<W: AsyncWrite + Unpin>(
    file: &mut File,
    out: &mut ContentWriter<'_, W>,
) -> Result<u64> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        out.write(&buf[..n]).await?;
        copied += n as u64;
    }
    Ok(copied)
}

fn end_of<R: AsyncRead + Unpin>(payload: &Payload<'_, R>, outcome: TurnOutcome) -> TurnOutcome {
    if payload.reached_eof() {
        TurnOutcome::EndOfStream
    } else {
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FilterError;
    use crate::filter::protocol::{encode_packet, read_packet, Packet};
    use crate::lfs::pointer::Oid;
    use crate::transfer::source::{DirectorySource, UnconfiguredSource};
    use sha2::{Digest, Sha256};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn payload_bytes(chunks: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for c in chunks {
            out.extend_from_slice(&encode_packet(c).unwrap());
        }
        out.extend_from_slice(b"0000");
        out
    }

    async fn content_of(mut wire: &[u8]) -> Vec<u8> {
        let mut content = Vec::new();
        while let Some(Packet::Data(d)) = read_packet(&mut wire).await.unwrap() {
            content.extend_from_slice(&d);
        }
        content
    }

    fn put_object(store: &LocalStore, content: &[u8]) -> Oid {
        let oid = Oid::from_digest(&Sha256::digest(content));
        let path = store.object_path(&oid);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
        oid
    }

    fn context(temp: &TempDir, skip: bool, filter: PathFilter) -> SmudgeContext {
        SmudgeContext {
            store: LocalStore::new(temp.path().join("local")),
            source: Arc::new(DirectorySource::new(temp.path().join("remote"))),
            skip,
            filter,
            retry: RetryPolicy {
                max_retries: 0,
                delay: Duration::from_millis(1),
            },
        }
    }

    async fn run_smudge(input: &[u8], pathname: &str, ctx: &SmudgeContext) -> (Result<TurnOutcome>, Vec<u8>) {
        let mut reader = input;
        let mut wire = Vec::new();
        let mut payload = Payload::new(&mut reader);
        let mut out = ContentWriter::new(&mut wire, 1024);
        let result = smudge(&mut payload, &mut out, pathname, ctx).await;
        out.finish().await.unwrap();
        let content = content_of(&wire).await;
        (result, content)
    }

    #[tokio::test]
    async fn test_clean_stores_content() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path());
        let input = payload_bytes(&[b"hello ", b"world"]);

        let mut reader = &input[..];
        let mut wire = Vec::new();
        let mut payload = Payload::new(&mut reader);
        let mut out = ContentWriter::new(&mut wire, 512);
        let outcome = clean(&mut payload, &mut out, "greeting.txt", &store, None)
            .await
            .unwrap();
        out.finish().await.unwrap();

        assert!(matches!(outcome, TurnOutcome::Ok));
        let pointer = Pointer::decode(&content_of(&wire).await).unwrap();
        assert_eq!(pointer.size, 11);
        assert!(store.has_object(&pointer.oid, 11).await);
    }

    #[tokio::test]
    async fn test_clean_of_pointer_echoes_it() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path());
        let pointer = Pointer::new(Oid::from_digest(&[5; 32]), 99);
        let input = payload_bytes(&[pointer.encode().as_bytes()]);

        let mut reader = &input[..];
        let mut wire = Vec::new();
        let mut payload = Payload::new(&mut reader);
        let mut out = ContentWriter::new(&mut wire, 512);
        clean(&mut payload, &mut out, "p.bin", &store, None)
            .await
            .unwrap();
        out.finish().await.unwrap();

        assert_eq!(content_of(&wire).await, pointer.encode().into_bytes());
        assert!(!store.has_object(&pointer.oid, 99).await);
    }

    #[tokio::test]
    async fn test_clean_empty_content_writes_nothing() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path());

        let mut reader = &b"0000"[..];
        let mut wire = Vec::new();
        let mut payload = Payload::new(&mut reader);
        let mut out = ContentWriter::new(&mut wire, 512);
        clean(&mut payload, &mut out, "empty.txt", &store, None)
            .await
            .unwrap();
        assert_eq!(out.finish().await.unwrap(), 0);
        assert_eq!(wire, b"0000");
    }

    #[tokio::test]
    async fn test_smudge_fetches_from_remote() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp, false, PathFilter::default());
        let oid = put_object(&LocalStore::new(temp.path().join("remote")), b"binary data");
        let input = payload_bytes(&[Pointer::new(oid.clone(), 11).encode().as_bytes()]);

        let (result, content) = run_smudge(&input, "a.bin", &ctx).await;
        assert!(matches!(result.unwrap(), TurnOutcome::Ok));
        assert_eq!(content, b"binary data");
        assert!(ctx.store.has_object(&oid, 11).await);
    }

    #[tokio::test]
    async fn test_smudge_passthrough_not_a_pointer() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp, false, PathFilter::default());
        let big = vec![b'x'; 3000];
        let input = payload_bytes(&[b"plain text, ", &big]);

        let (result, content) = run_smudge(&input, "notes.txt", &ctx).await;
        assert!(matches!(result.unwrap(), TurnOutcome::PassthroughNotAPointer));
        assert_eq!(content.len(), 12 + 3000);
        assert!(content.starts_with(b"plain text, "));
    }

    #[tokio::test]
    async fn test_smudge_skip_and_filter_keep_pointer() {
        let temp = TempDir::new().unwrap();
        let pointer = Pointer::new(Oid::from_digest(&[8; 32]), 5);
        let input = payload_bytes(&[pointer.encode().as_bytes()]);

        let skipping = context(&temp, true, PathFilter::default());
        let (result, content) = run_smudge(&input, "a.bin", &skipping).await;
        assert!(matches!(result.unwrap(), TurnOutcome::Ok));
        assert_eq!(content, pointer.encode().into_bytes());

        let excluded = context(&temp, false, PathFilter::new(&[] as &[&str], &["*.bin"]).unwrap());
        let (result, content) = run_smudge(&input, "a.bin", &excluded).await;
        assert!(matches!(result.unwrap(), TurnOutcome::Ok));
        assert_eq!(content, pointer.encode().into_bytes());
    }

    #[tokio::test]
    async fn test_smudge_missing_object_is_recoverable() {
        let temp = TempDir::new().unwrap();
        let mut ctx = context(&temp, false, PathFilter::default());
        ctx.source = Arc::new(UnconfiguredSource);
        let pointer = Pointer::new(Oid::from_digest(&[4; 32]), 5);
        let input = payload_bytes(&[pointer.encode().as_bytes()]);

        let (result, content) = run_smudge(&input, "a.bin", &ctx).await;
        let err = result.unwrap_err();
        assert!(matches!(err, FilterError::Io(_)));
        assert!(!err.is_fatal());
        assert!(content.is_empty());
    }

    #[tokio::test]
    async fn test_smudge_empty_payload() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp, false, PathFilter::default());
        let (result, content) = run_smudge(b"0000", "empty.txt", &ctx).await;
        assert!(matches!(result.unwrap(), TurnOutcome::Ok));
        assert!(content.is_empty());
    }
}
