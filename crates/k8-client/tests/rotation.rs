mod common;

use std::io::Error as IoError;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use k8_client::ChangeEvent;
use k8_client::ChangeKind;
use k8_client::ChangeSource;
use k8_client::PollingSource;
use k8_client::ROTATION_MARKER;
use k8_client::Result;
use k8_client::TokenReloader;
use k8_client::TokenRotationWatcher;

struct ChannelSource(mpsc::UnboundedReceiver<ChangeEvent>);

#[async_trait]
impl ChangeSource for ChannelSource {
    async fn next_event(&mut self) -> Option<Result<ChangeEvent, IoError>> {
        self.0.recv().await.map(Ok)
    }
}

#[derive(Default)]
struct CountingReloader(AtomicUsize);

impl CountingReloader {
    fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenReloader for CountingReloader {
    async fn reload(&self) -> Result<u64> {
        Ok(self.0.fetch_add(1, Ordering::SeqCst) as u64 + 1)
    }
}

async fn wait_for(reloader: &CountingReloader, expected: usize) -> bool {
    for _ in 0..200 {
        if reloader.count() >= expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_only_rotation_events_reload() {
    let (tx, rx) = mpsc::unbounded_channel();
    let reloader = Arc::new(CountingReloader::default());
    let watcher = TokenRotationWatcher::start_with_source(
        Path::new("/var/run/secrets/token"),
        Box::new(ChannelSource(rx)),
        reloader.clone(),
    )
    .expect("watcher");
    assert!(watcher.is_running());

    tx.send(ChangeEvent::new(ChangeKind::Modified, "ca.crt")).expect("send");
    tx.send(ChangeEvent::new(ChangeKind::MovedTo, ROTATION_MARKER)).expect("send");
    assert!(wait_for(&reloader, 1).await);

    tx.send(ChangeEvent::new(ChangeKind::ClosedWrite, "token")).expect("send");
    assert!(wait_for(&reloader, 2).await);

    watcher.stop().await;
    let _ = tx.send(ChangeEvent::new(ChangeKind::MovedTo, ROTATION_MARKER));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(reloader.count(), 2);
}

#[tokio::test]
async fn test_polling_source_detects_new_token() {
    let dir = tempfile::tempdir().expect("tempdir");
    let token_file = dir.path().join("token");
    std::fs::write(&token_file, "token-a").expect("write");

    let reloader = Arc::new(CountingReloader::default());
    let source = PollingSource::new(&token_file, Duration::from_millis(20)).expect("source");
    let watcher =
        TokenRotationWatcher::start_with_source(&token_file, Box::new(source), reloader.clone())
            .expect("watcher");

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(reloader.count(), 0, "unchanged token is not a rotation");

    std::fs::write(&token_file, "token-b").expect("rotate");
    assert!(wait_for(&reloader, 1).await);
    watcher.stop().await;
}

#[cfg(target_os = "linux")]
mod inotify {

    use std::os::unix::fs::symlink;
    use std::sync::Arc;

    use k8_client::ConnectionManager;
    use k8_client::K8Client;
    use k8_client::TokenRotationWatcher;
    use k8_client::k8_config::UserDetail;

    use super::CountingReloader;
    use super::common::MockServer;
    use super::common::Reply;
    use super::wait_for;

    /// lay out a directory the way a projected volume does
    fn project(dir: &std::path::Path, version: &str, token: &str) {
        let data = dir.join(format!("..{version}"));
        std::fs::create_dir(&data).expect("data dir");
        std::fs::write(data.join("token"), token).expect("token");
        let tmp = dir.join("..data_tmp");
        symlink(&data, &tmp).expect("symlink");
        std::fs::rename(&tmp, dir.join("..data")).expect("swap");
    }

    #[tokio::test]
    async fn test_symlink_swap_triggers_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        project(dir.path(), "v1", "token-a");
        let token_file = dir.path().join("token");
        symlink(dir.path().join("..data").join("token"), &token_file).expect("token link");

        let reloader = Arc::new(CountingReloader::default());
        let watcher = TokenRotationWatcher::start(&token_file, reloader.clone()).expect("watcher");

        project(dir.path(), "v2", "token-b");
        assert!(wait_for(&reloader, 1).await);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_client_follows_rotated_token() {
        let server = MockServer::start(vec![Reply::ok("{}")]).await;
        let dir = tempfile::tempdir().expect("tempdir");
        let token_file = dir.path().join("token");
        std::fs::write(&token_file, "token-a").expect("write");

        let user = UserDetail {
            token_file: Some(token_file.to_string_lossy().into_owned()),
            ..Default::default()
        };
        let manager = ConnectionManager::builder(server.url())
            .user(user)
            .build()
            .await
            .expect("manager");
        let client = K8Client::from_manager(Arc::new(manager), "default");
        assert!(client.is_watching_token());

        std::fs::write(&token_file, "token-b").expect("rotate");
        let mut rotated = false;
        for _ in 0..200 {
            if client.manager().current_token().await.as_deref() == Some("token-b") {
                rotated = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(rotated);
        assert!(client.manager().generation().await >= 1);
        client.close().await;
    }
}
