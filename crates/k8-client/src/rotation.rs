//!
//! # Token rotation
//!
//! Mounted service account tokens are rotated by swapping a `..data` symlink
//! in the token's directory. The watcher follows the directory, not the file,
//! and asks the connection manager to reload whenever the token changes.
//!
use std::ffi::OsStr;
use std::ffi::OsString;
use std::io::Error as IoError;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::Digest;
use sha2::Sha256;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::ClientError;
use crate::Result;
use crate::TokenReloader;

/// entry atomically swapped in when a projected volume is updated
pub const ROTATION_MARKER: &str = "..data";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    MovedTo,
    Created,
    Modified,
    ClosedWrite,
    Removed,
}

/// Change to an entry of the watched directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub name: OsString,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, name: impl Into<OsString>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

/// Platform specific feed of directory changes
#[async_trait]
pub trait ChangeSource: Send {
    /// `None` once the source can produce no more events
    async fn next_event(&mut self) -> Option<Result<ChangeEvent, IoError>>;
}

/// true if the event means the token has been replaced
pub fn is_rotation(event: &ChangeEvent, token_name: &OsStr) -> bool {
    let on_token = event.name.as_os_str() == token_name;
    match event.kind {
        ChangeKind::MovedTo => on_token || event.name == ROTATION_MARKER,
        ChangeKind::Created | ChangeKind::Modified | ChangeKind::ClosedWrite => on_token,
        ChangeKind::Removed => false,
    }
}

fn split_token_path(token_file: &Path) -> Result<(PathBuf, OsString)> {
    let name = token_file
        .file_name()
        .ok_or_else(|| ClientError::InvalidRequest(format!("{} is not a file", token_file.display())))?;
    let dir = match token_file.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((dir, name.to_owned()))
}

#[cfg(target_os = "linux")]
mod inotify {

    use std::collections::VecDeque;
    use std::io::Error as IoError;
    use std::os::fd::AsFd;
    use std::os::fd::AsRawFd;
    use std::os::fd::RawFd;
    use std::path::Path;

    use async_trait::async_trait;
    use nix::sys::inotify::AddWatchFlags;
    use nix::sys::inotify::InitFlags;
    use nix::sys::inotify::Inotify;
    use tokio::io::unix::AsyncFd;
    use tracing::debug;

    use super::ChangeEvent;
    use super::ChangeKind;
    use super::ChangeSource;

    struct InotifyFd(Inotify);

    impl AsRawFd for InotifyFd {
        fn as_raw_fd(&self) -> RawFd {
            self.0.as_fd().as_raw_fd()
        }
    }

    /// Directory changes from the kernel
    pub struct InotifySource {
        fd: AsyncFd<InotifyFd>,
        pending: VecDeque<ChangeEvent>,
    }

    impl InotifySource {
        pub fn new(dir: &Path) -> Result<Self, IoError> {
            let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)?;
            inotify.add_watch(
                dir,
                AddWatchFlags::IN_MOVED_TO
                    | AddWatchFlags::IN_CREATE
                    | AddWatchFlags::IN_MODIFY
                    | AddWatchFlags::IN_CLOSE_WRITE
                    | AddWatchFlags::IN_DELETE
                    | AddWatchFlags::IN_MOVED_FROM,
            )?;
            debug!(?dir, "watching directory with inotify");
            // SAFETY: InotifyFd owns the descriptor, it stays open and unchanged until the AsyncFd drops it
            let fd = unsafe { AsyncFd::register(InotifyFd(inotify)) }?;
            Ok(Self {
                fd,
                pending: VecDeque::new(),
            })
        }
    }

    fn kind_of(mask: AddWatchFlags) -> Option<ChangeKind> {
        if mask.contains(AddWatchFlags::IN_MOVED_TO) {
            Some(ChangeKind::MovedTo)
        } else if mask.contains(AddWatchFlags::IN_CREATE) {
            Some(ChangeKind::Created)
        } else if mask.contains(AddWatchFlags::IN_CLOSE_WRITE) {
            Some(ChangeKind::ClosedWrite)
        } else if mask.contains(AddWatchFlags::IN_MODIFY) {
            Some(ChangeKind::Modified)
        } else if mask.intersects(AddWatchFlags::IN_DELETE | AddWatchFlags::IN_MOVED_FROM) {
            Some(ChangeKind::Removed)
        } else {
            None
        }
    }

    #[async_trait]
    impl ChangeSource for InotifySource {
        async fn next_event(&mut self) -> Option<Result<ChangeEvent, IoError>> {
            loop {
                if let Some(event) = self.pending.pop_front() {
                    return Some(Ok(event));
                }

                let mut guard = match self.fd.readable().await {
                    Ok(guard) => guard,
                    Err(err) => return Some(Err(err)),
                };
                match guard.try_io(|fd| fd.get_ref().0.read_events().map_err(IoError::from)) {
                    Ok(Ok(events)) => {
                        for event in events {
                            if let (Some(kind), Some(name)) = (kind_of(event.mask), event.name) {
                                self.pending.push_back(ChangeEvent { kind, name });
                            }
                        }
                    }
                    Ok(Err(err)) => return Some(Err(err)),
                    Err(_would_block) => continue,
                }
            }
        }
    }
}

#[cfg(target_os = "linux")]
pub use inotify::InotifySource;

/// native directory watch for this platform
pub fn native_source(token_file: &Path) -> Result<Box<dyn ChangeSource>> {
    #[cfg(target_os = "linux")]
    {
        let (dir, _) = split_token_path(token_file)?;
        Ok(Box::new(InotifySource::new(&dir)?))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = token_file;
        Err(ClientError::Io(IoError::new(
            ErrorKind::Unsupported,
            "no native file watcher on this platform",
        )))
    }
}

/// Fallback that compares the token and the rotation marker on an interval
pub struct PollingSource {
    dir: PathBuf,
    name: OsString,
    interval: Duration,
    last: Option<Fingerprint>,
}

#[derive(Debug, Clone, PartialEq)]
struct Fingerprint {
    digest: Vec<u8>,
    marker: Option<PathBuf>,
}

impl PollingSource {
    pub fn new(token_file: &Path, interval: Duration) -> Result<Self> {
        let (dir, name) = split_token_path(token_file)?;
        if !dir.is_dir() {
            return Err(ClientError::Io(IoError::new(
                ErrorKind::NotFound,
                format!("{} is not a directory", dir.display()),
            )));
        }
        let last = Self::fingerprint_of(&dir, &dir.join(&name));
        Ok(Self {
            dir,
            name,
            interval,
            last,
        })
    }

    fn token_path(&self) -> PathBuf {
        self.dir.join(&self.name)
    }

    fn fingerprint_of(dir: &Path, token: &Path) -> Option<Fingerprint> {
        let contents = std::fs::read(token).ok()?;
        Some(Fingerprint {
            digest: Sha256::digest(&contents).to_vec(),
            marker: std::fs::read_link(dir.join(ROTATION_MARKER)).ok(),
        })
    }
}

#[async_trait]
impl ChangeSource for PollingSource {
    async fn next_event(&mut self) -> Option<Result<ChangeEvent, IoError>> {
        loop {
            sleep(self.interval).await;
            let dir = self.dir.clone();
            let token = self.token_path();
            let current = match tokio::task::spawn_blocking(move || Self::fingerprint_of(&dir, &token)).await {
                Ok(current) => current,
                Err(err) => return Some(Err(IoError::other(err))),
            };

            if current == self.last {
                continue;
            }
            trace!(name = ?self.name, "token fingerprint changed");
            let kind = if current.is_some() {
                ChangeKind::Modified
            } else {
                ChangeKind::Removed
            };
            self.last = current;
            return Some(Ok(ChangeEvent::new(kind, self.name.clone())));
        }
    }
}

/// Background task reloading credentials when the token file is rotated
#[derive(Debug)]
pub struct TokenRotationWatcher {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl TokenRotationWatcher {
    /// watch with the native source, polling when that is unavailable
    pub fn start(token_file: &Path, reloader: Arc<dyn TokenReloader>) -> Result<Self> {
        let source: Box<dyn ChangeSource> = match native_source(token_file) {
            Ok(source) => source,
            Err(err) => {
                warn!(%err, "native file watcher unavailable, polling token file");
                Box::new(PollingSource::new(token_file, DEFAULT_POLL_INTERVAL)?)
            }
        };
        Self::start_with_source(token_file, source, reloader)
    }

    pub fn start_with_source(
        token_file: &Path,
        source: Box<dyn ChangeSource>,
        reloader: Arc<dyn TokenReloader>,
    ) -> Result<Self> {
        let (_, token_name) = split_token_path(token_file)?;
        let runtime = Handle::try_current()
            .map_err(|err| ClientError::InvalidRequest(format!("rotation watcher needs a runtime: {err}")))?;
        let cancel = CancellationToken::new();
        info!(?token_file, "watching token for rotation");
        let handle = runtime.spawn(watch_loop(source, token_name, reloader, cancel.clone()));
        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// stop watching; events still queued are discarded
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                warn!(%err, "token rotation watcher task failed");
            }
        }
    }
}

impl Drop for TokenRotationWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn watch_loop(
    mut source: Box<dyn ChangeSource>,
    token_name: OsString,
    reloader: Arc<dyn TokenReloader>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = source.next_event() => event,
        };

        match event {
            Some(Ok(event)) if is_rotation(&event, &token_name) => {
                info!(?event, "token rotated, reloading");
                match reloader.reload().await {
                    Ok(generation) => debug!(generation, "reload after rotation complete"),
                    Err(err) => warn!(%err, "token reload failed, keeping current credentials"),
                }
            }
            Some(Ok(event)) => trace!(?event, "ignoring directory change"),
            Some(Err(err)) => {
                warn!(%err, "file watch failed, token rotation no longer followed");
                break;
            }
            None => {
                debug!("change source closed");
                break;
            }
        }
    }
    debug!("token rotation watcher stopped");
}
