//! Secret change feed.
//!
//! Watches Secret metadata in the target namespace and turns updates of the
//! watched Secret into [`ChangeEvent`]s on an mpsc channel. Only metadata
//! is streamed; the Secret's data never enters the process.
//!
//! The feed keeps a local view of name -> resourceVersion. An update is an
//! `Apply` (or a re-list entry) for the watched Secret whose version differs
//! from the cached one. First sightings are creations, not updates.

use crate::config::WatchTarget;
use crate::error::ControllerError;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client, Resource};
use kube_runtime::watcher::{self, metadata_watcher};
use kube_runtime::WatchStreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Notification that the watched Secret was updated.
///
/// The restart loop reacts to the occurrence only; the version is carried
/// for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub resource_version: Option<String>,
}

/// What a single watch event means for the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedSignal {
    /// The initial list has been fully applied
    Synced,
    /// The watched Secret changed
    Changed(ChangeEvent),
}

/// Local synchronized view of the namespace's Secrets.
#[derive(Debug)]
pub struct SecretView {
    secret_name: String,
    versions: HashMap<String, Option<String>>,
    // Entries seen since the current (re-)list started
    relist: Option<HashMap<String, Option<String>>>,
    synced: bool,
}

impl SecretView {
    pub fn new(secret_name: impl Into<String>) -> Self {
        Self {
            secret_name: secret_name.into(),
            versions: HashMap::new(),
            relist: None,
            synced: false,
        }
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    fn observe(&self, name: &str, version: &Option<String>) -> Option<FeedSignal> {
        if name != self.secret_name || !self.synced {
            return None;
        }
        match self.versions.get(name) {
            Some(cached) if cached != version => Some(FeedSignal::Changed(ChangeEvent {
                resource_version: version.clone(),
            })),
            _ => None,
        }
    }

    /// Apply one watch event to the view.
    pub fn apply<K: Resource>(&mut self, event: watcher::Event<K>) -> Option<FeedSignal> {
        match event {
            watcher::Event::Init => {
                self.relist = Some(HashMap::new());
                None
            }
            watcher::Event::InitApply(obj) => {
                let meta = obj.meta();
                let name = meta.name.clone().unwrap_or_default();
                let version = meta.resource_version.clone();
                let signal = self.observe(&name, &version);
                self.relist.get_or_insert_with(HashMap::new).insert(name, version);
                signal
            }
            watcher::Event::InitDone => {
                if let Some(listed) = self.relist.take() {
                    self.versions = listed;
                }
                if self.synced {
                    None
                } else {
                    self.synced = true;
                    Some(FeedSignal::Synced)
                }
            }
            watcher::Event::Apply(obj) => {
                let meta = obj.meta();
                let name = meta.name.clone().unwrap_or_default();
                let version = meta.resource_version.clone();
                let signal = self.observe(&name, &version);
                self.versions.insert(name, version);
                signal
            }
            watcher::Event::Delete(obj) => {
                if let Some(name) = obj.meta().name.as_deref() {
                    self.versions.remove(name);
                }
                None
            }
        }
    }
}

/// Watches one Secret and feeds change notifications to the scheduler.
pub struct ChangeFeed {
    api: Api<Secret>,
    target: WatchTarget,
}

impl ChangeFeed {
    /// Creates a new feed for `target`.
    pub fn new(client: Client, target: WatchTarget) -> Self {
        Self {
            api: Api::namespaced(client, &target.namespace),
            target,
        }
    }

    /// Start the watch task and wait for the initial sync.
    ///
    /// Returns the running task once the initial list is applied. Failing to
    /// sync within `sync_timeout`, or a watch error before sync, is fatal.
    pub async fn start(
        self,
        events: mpsc::Sender<ChangeEvent>,
        shutdown: CancellationToken,
        sync_timeout: Duration,
    ) -> Result<JoinHandle<Result<(), ControllerError>>, ControllerError> {
        info!("Starting Secret watcher for {}", self.target);
        let config = watcher::Config::default()
            .fields(&format!("metadata.name={}", self.target.secret_name));
        let stream = metadata_watcher(self.api, config).default_backoff();

        start_feed(stream, self.target, events, shutdown, sync_timeout).await
    }
}

async fn start_feed<S, K>(
    stream: S,
    target: WatchTarget,
    events: mpsc::Sender<ChangeEvent>,
    shutdown: CancellationToken,
    sync_timeout: Duration,
) -> Result<JoinHandle<Result<(), ControllerError>>, ControllerError>
where
    S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send + 'static,
    K: Resource + Send + 'static,
{
    let (synced_tx, synced_rx) = oneshot::channel();
    let mut handle = tokio::spawn(run_feed(stream, target, events, shutdown, synced_tx));

    match tokio::time::timeout(sync_timeout, synced_rx).await {
        Ok(Ok(())) => Ok(handle),
        // Task ended before reporting sync
        Ok(Err(_)) => match (&mut handle).await {
            Ok(Err(e)) => Err(e),
            Ok(Ok(())) => Err(ControllerError::InitialSync(
                "watch stopped before the initial sync completed".to_string(),
            )),
            Err(e) => Err(ControllerError::InitialSync(format!("watch task panicked: {}", e))),
        },
        Err(_) => {
            handle.abort();
            Err(ControllerError::InitialSync(format!(
                "cache not synced after {}s",
                sync_timeout.as_secs()
            )))
        }
    }
}

async fn run_feed<S, K>(
    stream: S,
    target: WatchTarget,
    events: mpsc::Sender<ChangeEvent>,
    shutdown: CancellationToken,
    synced: oneshot::Sender<()>,
) -> Result<(), ControllerError>
where
    S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send + 'static,
    K: Resource + Send + 'static,
{
    let mut synced = Some(synced);
    let mut view = SecretView::new(target.secret_name.clone());
    let mut stream = stream.boxed();

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = stream.next() => next,
        };
        let Some(result) = next else {
            return Err(ControllerError::Watch("Secret watch stream ended".to_string()));
        };

        match result {
            Ok(event) => match view.apply(event) {
                Some(FeedSignal::Synced) => {
                    info!("Secret watcher initialization complete for {}", target);
                    if let Some(tx) = synced.take() {
                        let _ = tx.send(());
                    }
                }
                Some(FeedSignal::Changed(change)) => {
                    info!(
                        secret = %target,
                        resource_version = change.resource_version.as_deref().unwrap_or("<none>"),
                        "Secret changed"
                    );
                    if !deliver(&events, change) {
                        info!("Restart scheduler gone, stopping Secret watcher");
                        break;
                    }
                }
                None => {}
            },
            Err(e) if !view.is_synced() => {
                return Err(ControllerError::InitialSync(e.to_string()));
            }
            Err(e) => warn!("Secret watch error for {} (will retry): {}", target, e),
        }
    }

    info!("Secret watcher for {} stopped", target);
    Ok(())
}

/// Hand a change to the scheduler without blocking the watch.
///
/// A full buffer already holds an undelivered change, which is enough to
/// guarantee a restart, so the extra one is dropped. Returns `false` once
/// the receiver is gone.
pub fn deliver(events: &mpsc::Sender<ChangeEvent>, change: ChangeEvent) -> bool {
    match events.try_send(change) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            debug!("Change buffer full, restart already queued");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_secret;

    fn synced_view(initial_version: &str) -> SecretView {
        let mut view = SecretView::new("app-tls");
        view.apply(watcher::Event::<Secret>::Init);
        let watched = create_test_secret("app-tls", "prod", initial_version);
        view.apply(watcher::Event::InitApply(watched));
        view.apply(watcher::Event::InitApply(create_test_secret("other", "prod", "7")));
        assert_eq!(view.apply(watcher::Event::<Secret>::InitDone), Some(FeedSignal::Synced));
        view
    }

    #[test]
    fn test_no_notifications_before_sync() {
        let mut view = SecretView::new("app-tls");
        view.apply(watcher::Event::<Secret>::Init);

        let listed = create_test_secret("app-tls", "prod", "1");
        let signal = view.apply(watcher::Event::InitApply(listed));

        assert_eq!(signal, None);
        assert!(!view.is_synced());
    }

    #[test]
    fn test_update_of_watched_secret_notifies() {
        let mut view = synced_view("1");

        let signal = view.apply(watcher::Event::Apply(create_test_secret("app-tls", "prod", "2")));

        assert_eq!(
            signal,
            Some(FeedSignal::Changed(ChangeEvent { resource_version: Some("2".to_string()) }))
        );
    }

    #[test]
    fn test_other_secrets_are_filtered() {
        let mut view = synced_view("1");

        let signal = view.apply(watcher::Event::Apply(create_test_secret("other", "prod", "8")));

        assert_eq!(signal, None);
    }

    #[test]
    fn test_creation_is_not_an_update() {
        let mut view = SecretView::new("app-tls");
        view.apply(watcher::Event::<Secret>::Init);
        view.apply(watcher::Event::<Secret>::InitDone);

        let created = view.apply(watcher::Event::Apply(create_test_secret("app-tls", "prod", "3")));
        let updated = view.apply(watcher::Event::Apply(create_test_secret("app-tls", "prod", "4")));

        assert_eq!(created, None);
        assert!(matches!(updated, Some(FeedSignal::Changed(_))));
    }

    #[test]
    fn test_unchanged_relist_is_silent() {
        let mut view = synced_view("1");

        view.apply(watcher::Event::<Secret>::Init);
        let listed = create_test_secret("app-tls", "prod", "1");
        let signal = view.apply(watcher::Event::InitApply(listed));
        let done = view.apply(watcher::Event::<Secret>::InitDone);

        assert_eq!(signal, None);
        // Sync is only reported once
        assert_eq!(done, None);
    }

    #[test]
    fn test_relist_with_new_version_notifies() {
        let mut view = synced_view("1");

        view.apply(watcher::Event::<Secret>::Init);
        let listed = create_test_secret("app-tls", "prod", "5");
        let signal = view.apply(watcher::Event::InitApply(listed));

        assert!(matches!(signal, Some(FeedSignal::Changed(_))));
    }

    #[test]
    fn test_recreated_secret_is_not_an_update() {
        let mut view = synced_view("1");

        view.apply(watcher::Event::Delete(create_test_secret("app-tls", "prod", "1")));
        let signal = view.apply(watcher::Event::Apply(create_test_secret("app-tls", "prod", "9")));

        assert_eq!(signal, None);
    }

    #[tokio::test]
    async fn test_deliver_never_blocks_on_full_buffer() {
        let (tx, mut rx) = mpsc::channel(1);
        let change = ChangeEvent { resource_version: None };

        assert!(deliver(&tx, change.clone()));
        assert!(deliver(&tx, change.clone()));

        assert_eq!(rx.recv().await, Some(change));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deliver_reports_closed_receiver() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        assert!(!deliver(&tx, ChangeEvent { resource_version: None }));
    }

    fn watch_target() -> WatchTarget {
        WatchTarget {
            namespace: "prod".to_string(),
            secret_name: "app-tls".to_string(),
        }
    }

    type SecretEvent = Result<watcher::Event<Secret>, watcher::Error>;

    #[tokio::test(start_paused = true)]
    async fn test_watch_error_before_sync_is_fatal() {
        let (tx, _rx) = mpsc::channel(4);
        let events: Vec<SecretEvent> = vec![
            Ok(watcher::Event::Init),
            Err(watcher::Error::NoResourceVersion),
        ];
        let stream = futures::stream::iter(events).chain(futures::stream::pending());

        let result = start_feed(
            stream,
            watch_target(),
            tx,
            CancellationToken::new(),
            Duration::from_secs(60),
        )
        .await;

        assert!(matches!(result, Err(ControllerError::InitialSync(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_ending_before_sync_is_fatal() {
        let (tx, _rx) = mpsc::channel(4);
        let events: Vec<SecretEvent> = vec![Ok(watcher::Event::Init)];

        let result = start_feed(
            futures::stream::iter(events),
            watch_target(),
            tx,
            CancellationToken::new(),
            Duration::from_secs(60),
        )
        .await;

        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_timeout_is_fatal() {
        let (tx, _rx) = mpsc::channel(4);
        let stream = futures::stream::pending::<SecretEvent>();

        let result = start_feed(
            stream,
            watch_target(),
            tx,
            CancellationToken::new(),
            Duration::from_secs(60),
        )
        .await;

        match result {
            Err(ControllerError::InitialSync(reason)) => {
                assert!(reason.contains("not synced after 60s"))
            }
            other => panic!("expected sync timeout, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_error_after_sync_keeps_feed_running() {
        let (tx, mut rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        let events: Vec<SecretEvent> = vec![
            Ok(watcher::Event::Init),
            Ok(watcher::Event::InitApply(create_test_secret("app-tls", "prod", "1"))),
            Ok(watcher::Event::InitDone),
            Err(watcher::Error::NoResourceVersion),
            Ok(watcher::Event::Apply(create_test_secret("app-tls", "prod", "2"))),
        ];
        let stream = futures::stream::iter(events).chain(futures::stream::pending());

        let handle = start_feed(
            stream,
            watch_target(),
            tx,
            shutdown.clone(),
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        let change = rx.recv().await.unwrap();
        assert_eq!(change.resource_version.as_deref(), Some("2"));
        assert!(!handle.is_finished());

        shutdown.cancel();
        assert!(matches!(handle.await, Ok(Ok(()))));
    }
}
