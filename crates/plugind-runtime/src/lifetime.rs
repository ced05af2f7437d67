use std::sync::Arc;
use std::time::Duration;

use plugind_types::DaemonError;
use tokio::sync::oneshot;

use crate::ops::PluginRuntimeOps;

/// Hook invoked once a runtime is ready to be tracked elsewhere (the plugin
/// manager's registry, the cluster's ownership ledger).
pub type RegisterFn = Box<dyn Fn(Arc<dyn PluginRuntimeOps>) -> Result<(), DaemonError> + Send + Sync>;

const MAX_INIT_FAILURES_BEFORE_NOTIFY: u32 = 3;
const INIT_RETRY_DELAY: Duration = Duration::from_secs(30);
const RESTART_DELAY: Duration = Duration::from_secs(5);

/// Drives a runtime through its full lifecycle: register, init (retrying
/// with backoff), then start/wait/restart forever until stopped.
///
/// `launched` is closed (a unit is sent) exactly once: either as soon as
/// `init_environment` first succeeds, or as soon as it has failed more than
/// [`MAX_INIT_FAILURES_BEFORE_NOTIFY`] times. `err` carries at most one
/// value — populated only on the latter path. Launched is notified exactly
/// once, regardless of outcome.
pub async fn run_lifetime(
    runtime: Arc<dyn PluginRuntimeOps>,
    registers: &[RegisterFn],
    mut launched: Option<oneshot::Sender<()>>,
    mut err: Option<oneshot::Sender<DaemonError>>,
) {
    let identity = runtime.identity().to_string();
    tracing::info!(plugin = %identity, "new plugin logged in");

    for register in registers {
        if let Err(e) = register(runtime.clone()) {
            tracing::error!(plugin = %identity, error = %e, "add plugin to cluster failed");
            runtime.stop().await;
            runtime.cleanup().await;
            tracing::info!(plugin = %identity, "plugin has exited");
            return;
        }
    }

    let mut failed_times: u32 = 0;
    let mut notified = false;

    while !runtime.stopped() {
        if failed_times > MAX_INIT_FAILURES_BEFORE_NOTIFY && !notified {
            notified = true;
            if let Some(tx) = err.take() {
                let _ = tx.send(DaemonError::Internal(format!(
                    "init environment for plugin {identity} failed too many times, \
                     you should consider the package is corrupted or your network is unstable"
                )));
            }
            if let Some(tx) = launched.take() {
                let _ = tx.send(());
            }
        }

        tracing::info!(plugin = %identity, "init environment for plugin");
        match runtime.init_environment().await {
            Ok(()) => break,
            Err(e) => {
                if runtime.stopped() {
                    break;
                }
                tracing::error!(plugin = %identity, error = %e, "init environment failed, retry in 30s");
                tokio::time::sleep(INIT_RETRY_DELAY).await;
                failed_times += 1;
            }
        }
    }

    if !notified {
        if let Some(tx) = launched.take() {
            let _ = tx.send(());
        }
        drop(err.take());
    }

    while !runtime.stopped() {
        if let Err(e) = runtime.start_plugin().await {
            if runtime.stopped() {
                break;
            }
            tracing::warn!(plugin = %identity, error = %e, "start_plugin failed");
        }

        runtime.wait().await;
        tokio::time::sleep(RESTART_DELAY).await;
        runtime.add_restarts();
    }

    runtime.trigger_stop();
    runtime.stop().await;
    runtime.cleanup().await;
    tracing::info!(plugin = %identity, "plugin has exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{RuntimeKind, SessionMessage};
    use plugind_session::{BroadcastReceiver, Broadcaster};
    use plugind_types::{Architecture, PluginCategory, PluginDeclaration, PluginUniqueIdentifier, RunnerHints};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use uuid::Uuid;

    struct FlakyRuntime {
        identifier: PluginUniqueIdentifier,
        declaration: PluginDeclaration,
        init_calls: AtomicU32,
        init_failures_before_success: u32,
        started: AtomicBool,
        stopped: AtomicBool,
        restarts: AtomicU32,
        broadcaster: Broadcaster<SessionMessage>,
    }

    fn test_declaration() -> (PluginUniqueIdentifier, PluginDeclaration) {
        let id = PluginUniqueIdentifier::parse(
            "acme/widget:1.0.0@1234567890abcdef1234567890abcdef1234567890abcdef",
        )
        .unwrap();
        let decl = PluginDeclaration {
            identifier: id.clone(),
            category: PluginCategory::Tool,
            memory_limit_bytes: 1,
            runner: RunnerHints { language: "python".into(), version: "3.12".into(), entrypoint: "m.py".into() },
            permission: Default::default(),
            supported_architectures: vec![Architecture::Amd64],
        };
        (id, decl)
    }

    #[async_trait::async_trait]
    impl PluginRuntimeOps for FlakyRuntime {
        fn identity(&self) -> &PluginUniqueIdentifier {
            &self.identifier
        }

        fn configuration(&self) -> &PluginDeclaration {
            &self.declaration
        }

        fn kind(&self) -> RuntimeKind {
            RuntimeKind::Local
        }

        async fn init_environment(&self) -> Result<(), DaemonError> {
            let calls = self.init_calls.fetch_add(1, Ordering::SeqCst);
            if calls < self.init_failures_before_success {
                Err(DaemonError::Internal("boom".into()))
            } else {
                Ok(())
            }
        }

        async fn start_plugin(&self) -> Result<(), DaemonError> {
            self.started.store(true, Ordering::SeqCst);
            // stop immediately after one start so the test terminates.
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn wait(&self) {}

        async fn write(&self, _session_id: Uuid, _data: &[u8]) -> Result<(), DaemonError> {
            Ok(())
        }

        async fn listen(&self) -> BroadcastReceiver<SessionMessage> {
            self.broadcaster.subscribe().await
        }

        async fn stop(&self) {}

        fn stopped(&self) -> bool {
            self.stopped.load(Ordering::SeqCst)
        }

        fn trigger_stop(&self) {}

        fn add_restarts(&self) {
            self.restarts.fetch_add(1, Ordering::SeqCst);
        }

        async fn cleanup(&self) {}
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn four_init_failures_then_recover_notifies_exactly_once() {
        let (identifier, declaration) = test_declaration();
        let runtime: Arc<dyn PluginRuntimeOps> = Arc::new(FlakyRuntime {
            identifier,
            declaration,
            init_calls: AtomicU32::new(0),
            init_failures_before_success: 4,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            restarts: AtomicU32::new(0),
            broadcaster: Broadcaster::new(8),
        });

        // speed the test up: the production retry delay is 30s, too slow for
        // a unit test, so run with tokio's paused virtual clock.
        tokio::time::pause();

        let (launched_tx, launched_rx) = oneshot::channel();
        let (err_tx, err_rx) = oneshot::channel();

        let handle = tokio::spawn(run_lifetime(runtime.clone(), &[], Some(launched_tx), Some(err_tx)));

        // advance past the four 30s retries.
        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(31)).await;
            tokio::task::yield_now().await;
        }
        tokio::time::advance(Duration::from_secs(6)).await;

        handle.await.unwrap();

        let err = err_rx.await;
        assert!(err.is_ok(), "errChan should receive exactly one error");
        launched_rx.await.expect("launched channel should close");
        assert!(runtime.stopped());
    }
}
