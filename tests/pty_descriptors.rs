//! Descriptor accounting across PTY sessions
//!
//! Lives in its own test binary so no other test opens descriptors while
//! `/proc/self/fd` is being counted.

#![cfg(target_os = "linux")]

use std::time::Duration;

use ptybridge::{PtySession, SessionConfig, TerminalSize};
use tokio::time::{sleep, timeout};

const CYCLES: usize = 20;

fn open_descriptors() -> usize {
    std::fs::read_dir("/proc/self/fd")
        .map(|entries| entries.count())
        .unwrap_or(0)
}

async fn open_and_terminate(config: &SessionConfig) {
    let session = PtySession::open(config, TerminalSize::default()).unwrap();
    session.write(b"cycle\n").await.unwrap();
    session.terminate().await;
    assert!(session.is_closed().await);
}

#[tokio::test]
async fn test_terminate_releases_descriptors() {
    let config = SessionConfig::new("cat");

    // Warm-up: the runtime's blocking pool and any lazily opened files settle here
    open_and_terminate(&config).await;
    sleep(Duration::from_millis(100)).await;
    let baseline = open_descriptors();
    assert!(baseline > 0);

    for _ in 0..CYCLES {
        open_and_terminate(&config).await;
    }

    let settled = timeout(Duration::from_secs(5), async {
        while open_descriptors() > baseline {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(
        settled.is_ok(),
        "descriptors grew from {baseline} to {} over {CYCLES} sessions",
        open_descriptors()
    );
}
