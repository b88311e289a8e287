//! The long-running filter-process session.
//!
//! One session per Git process: handshake, capability negotiation, then one
//! request per turn until Git closes the stream. Every turn is answered by a
//! final status, optionally preceded by a preliminary `success` and content.

use crate::error::{FilterError, Result};
use crate::filter::coordinator::DelayedFetchCoordinator;
use crate::filter::diagnostics::Diagnostics;
use crate::filter::protocol::{ContentWriter, MAX_PACKET_DATA};
use crate::filter::scanner::{self, Capabilities, Payload, Request};
use crate::filter::status::{final_status, Command, Status, TurnOutcome};
use crate::lfs::path_filter::PathFilter;
use crate::lfs::store::LocalStore;
use crate::lfs::transform::{self, copy_object, decode_from, smudge_decoded, Decoded, SmudgeContext};
use crate::transfer::{QueueConfig, SharedSource, TransferQueue};
use std::collections::BTreeSet;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite};

/// Clean output is a pointer, which fits in one small packet.
pub const CLEAN_BUFFER_CAPACITY: usize = 512;

pub const SMUDGE_BUFFER_CAPACITY: usize = MAX_PACKET_DATA;

/// Everything a session needs besides its streams.
#[derive(Clone)]
pub struct SessionOptions {
    pub store: LocalStore,
    pub source: SharedSource,
    /// Leave pointers in the working tree instead of fetching content.
    pub skip: bool,
    pub filter: PathFilter,
    pub queue: QueueConfig,
}

/// How a turn ended, before the final status is written.
struct Turn {
    outcome: TurnOutcome,
    written: u64,
    delayed: bool,
}

impl Turn {
    fn finished(outcome: TurnOutcome, written: u64) -> Self {
        Self {
            outcome,
            written,
            delayed: false,
        }
    }

    fn delayed() -> Self {
        Self {
            outcome: TurnOutcome::Ok,
            written: 0,
            delayed: true,
        }
    }
}

pub struct FilterSession<R, W> {
    reader: R,
    writer: W,
    smudge: SmudgeContext,
    queue_config: QueueConfig,
    capabilities: Capabilities,
    coordinator: Option<DelayedFetchCoordinator>,
    diagnostics: Diagnostics,
}

impl<R, W> FilterSession<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, options: SessionOptions) -> Self {
        let smudge = SmudgeContext {
            store: options.store,
            source: options.source,
            skip: options.skip,
            filter: options.filter,
            retry: options.queue.retry,
        };
        Self {
            reader,
            writer,
            smudge,
            queue_config: options.queue,
            capabilities: Capabilities::empty(),
            coordinator: None,
            diagnostics: Diagnostics::new(),
        }
    }

    pub async fn initialize(&mut self) -> Result<()> {
        scanner::initialize(&mut self.reader, &mut self.writer).await
    }

    /// Negotiate capabilities. The fetch pipeline is started only when Git
    /// supports delayed smudges.
    pub async fn negotiate_capabilities(&mut self) -> Result<BTreeSet<String>> {
        let advertised = scanner::negotiate_capabilities(&mut self.reader, &mut self.writer).await?;
        self.capabilities = Capabilities::from_advertised(&advertised);

        if self.supports_delay() && self.coordinator.is_none() {
            let queue = TransferQueue::new(self.smudge.source.clone(), self.queue_config.clone());
            self.coordinator = Some(DelayedFetchCoordinator::new(queue)?);
        }
        tracing::debug!(capabilities = ?self.capabilities, "negotiated");
        Ok(advertised)
    }

    pub fn supports_delay(&self) -> bool {
        self.capabilities.contains(Capabilities::DELAY)
    }

    /// Serve requests until Git closes the stream.
    ///
    /// Only fatal errors are returned; everything else is answered with
    /// `status=error` and the session continues.
    pub async fn run(mut self) -> Result<Diagnostics> {
        while let Some(request) = scanner::read_request(&mut self.reader).await? {
            if self.turn(&request).await? {
                tracing::debug!("stream ended inside a request payload");
                break;
            }
        }

        if let Some(coordinator) = self.coordinator.take() {
            coordinator.shutdown();
        }
        Ok(self.diagnostics)
    }

    /// Handle one request. Returns true if the stream ended mid-payload.
    async fn turn(&mut self, request: &Request) -> Result<bool> {
        let command = Command::parse(request.command()).ok_or_else(|| {
            FilterError::ProtocolViolation(format!("unknown command {:?}", request.command()))
        })?;
        let pathname = request.pathname();
        tracing::debug!(?command, pathname, can_delay = request.can_delay(), "request");

        let Self {
            reader,
            writer,
            smudge,
            coordinator,
            diagnostics,
            ..
        } = self;

        let (turn, end_of_stream) = match command {
            Command::ListAvailableBlobs => (list_available(writer, coordinator.as_ref()).await?, false),
            Command::Clean | Command::Smudge => {
                let mut payload = Payload::new(reader);
                let turn = match (command, coordinator.as_ref()) {
                    (Command::Clean, _) => clean_turn(&mut payload, writer, pathname, &smudge.store).await?,
                    (_, None) => smudge_turn(&mut payload, writer, pathname, smudge).await?,
                    (_, Some(coord)) if request.can_delay() => {
                        delayable_turn(&mut payload, writer, pathname, smudge, coord).await?
                    }
                    (_, Some(coord)) => rerequest_turn(&mut payload, writer, pathname, smudge, coord).await?,
                };
                payload.drain().await?;
                (turn, payload.reached_eof())
            }
        };

        let outcome = diagnostics.record(pathname, command, turn.outcome, turn.written);
        if let TurnOutcome::Failure(e) = &outcome {
            tracing::warn!(pathname, "{:?} failed: {}", command, e);
        }
        scanner::write_status(writer, final_status(&outcome, turn.delayed)).await?;
        Ok(end_of_stream)
    }
}

async fn clean_turn<R, W>(
    payload: &mut Payload<'_, R>,
    writer: &mut W,
    pathname: &str,
    store: &LocalStore,
) -> Result<Turn>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    scanner::write_status(writer, Status::Success).await?;
    let mut out = ContentWriter::new(writer, CLEAN_BUFFER_CAPACITY);
    let result = transform::clean(payload, &mut out, pathname, store, None).await;
    let written = out.finish().await?;
    Ok(Turn::finished(TurnOutcome::from_result(result)?, written))
}

async fn smudge_turn<R, W>(
    payload: &mut Payload<'_, R>,
    writer: &mut W,
    pathname: &str,
    ctx: &SmudgeContext,
) -> Result<Turn>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let decoded = decode_from(payload).await?;
    serve_decoded(decoded, payload, writer, pathname, ctx).await
}

async fn serve_decoded<R, W>(
    decoded: Decoded,
    payload: &mut Payload<'_, R>,
    writer: &mut W,
    pathname: &str,
    ctx: &SmudgeContext,
) -> Result<Turn>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    scanner::write_status(writer, Status::Success).await?;
    let mut out = ContentWriter::new(writer, SMUDGE_BUFFER_CAPACITY);
    let result = smudge_decoded(decoded, payload, &mut out, pathname, ctx).await;
    let written = out.finish().await?;
    Ok(Turn::finished(TurnOutcome::from_result(result)?, written))
}

/// Smudge with `can-delay=1`: hand pointers to the coordinator and answer
/// `delayed`. Content that is not fetched is served right away.
async fn delayable_turn<R, W>(
    payload: &mut Payload<'_, R>,
    writer: &mut W,
    pathname: &str,
    ctx: &SmudgeContext,
    coordinator: &DelayedFetchCoordinator,
) -> Result<Turn>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let decoded = decode_from(payload).await?;
    let pointer = match decoded {
        Decoded::Pointer(pointer) if ctx.should_materialize(pathname) => pointer,
        other => return serve_decoded(other, payload, writer, pathname, ctx).await,
    };

    let requested = async {
        let local_path = ctx.store.local_media_path(&pointer.oid).await?;
        coordinator.request_fetch(pathname, local_path, pointer.oid.clone(), pointer.size)?;
        Ok::<_, FilterError>(TurnOutcome::Ok)
    }
    .await;

    match TurnOutcome::from_result(requested)? {
        TurnOutcome::Failure(e) => Ok(Turn::finished(TurnOutcome::Failure(e), 0)),
        _ => {
            tracing::debug!(pathname, oid = %pointer.oid, "delayed");
            Ok(Turn::delayed())
        }
    }
}

/// Smudge without `can-delay` once delay is negotiated: Git is collecting a
/// pathname it was told is available.
async fn rerequest_turn<R, W>(
    payload: &mut Payload<'_, R>,
    writer: &mut W,
    pathname: &str,
    ctx: &SmudgeContext,
    coordinator: &DelayedFetchCoordinator,
) -> Result<Turn>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let Some(record) = coordinator.consume(pathname).await else {
        if payload.is_empty().await? {
            return Err(FilterError::ProtocolViolation(format!(
                "{:?} was requested again but never delayed",
                pathname
            )));
        }
        // Git did not allow this item to be delayed.
        return smudge_turn(payload, writer, pathname, ctx).await;
    };
    payload.drain().await?;

    let mut file = match File::open(&record.local_path).await {
        Ok(file) => file,
        Err(e) => {
            let err = FilterError::transfer(
                record.oid.as_str(),
                format!("cannot open cached object for {}: {}", pathname, e),
            );
            return Ok(Turn::finished(TurnOutcome::Failure(err), 0));
        }
    };

    scanner::write_status(writer, Status::Success).await?;
    let mut out = ContentWriter::new(writer, SMUDGE_BUFFER_CAPACITY);
    let result = copy_object(&mut file, &mut out)
        .await
        .map(|_| TurnOutcome::Ok);
    let written = out.finish().await?;
    Ok(Turn::finished(TurnOutcome::from_result(result)?, written))
}

async fn list_available<W: AsyncWrite + Unpin>(
    writer: &mut W,
    coordinator: Option<&DelayedFetchCoordinator>,
) -> Result<Turn> {
    let Some(coordinator) = coordinator else {
        scanner::write_list(writer, std::iter::empty::<String>()).await?;
        return Ok(Turn::finished(TurnOutcome::Ok, 0));
    };

    let drained = coordinator.drain_once().await;
    let names = coordinator.available().await;
    tracing::debug!(count = names.len(), "listing available blobs");
    let lines: Vec<String> = names.iter().map(|n| format!("pathname={}", n)).collect();
    scanner::write_list(writer, lines).await?;

    let outcome = TurnOutcome::from_result(drained.map(|_| TurnOutcome::Ok))?;
    Ok(Turn::finished(outcome, 0))
}

/// Run a whole session: handshake, negotiation and the request loop.
pub async fn serve<R, W>(reader: R, writer: W, options: SessionOptions) -> Result<Diagnostics>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut session = FilterSession::new(reader, writer, options);
    session.initialize().await?;
    session.negotiate_capabilities().await?;
    session.run().await
}
