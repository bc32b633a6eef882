/// Periodic now-playing metadata fetch.
///
/// The poller is a single task ticking at a fixed period.  Each tick fetches
/// from the `MetadataSource` and hands a successful result to the sink; a
/// failed fetch is logged and the sink keeps whatever it shows.  The task
/// holds only a weak reference to its sink and exits once the owner is gone.
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use nowplaying_proto::metadata::{MetadataSource, SongMetadata};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Receives fetched metadata.
#[async_trait]
pub trait MetadataSink: Send + Sync {
    async fn apply_metadata(&self, song: SongMetadata);
}

pub struct MetadataPoller {
    task: JoinHandle<()>,
    wake: Arc<Notify>,
}

impl MetadataPoller {
    /// Start polling.  The first fetch happens one `period` from now.
    pub fn spawn(
        source: Arc<dyn MetadataSource>,
        sink: Weak<dyn MetadataSink>,
        period: Duration,
    ) -> Self {
        let wake = Arc::new(Notify::new());
        let task = tokio::spawn(run(source, sink, period, Arc::clone(&wake)));
        debug!("poller: started, period={:?}", period);
        Self { task, wake }
    }

    /// Fetch now instead of waiting for the next tick.
    pub fn poke(&self) {
        self.wake.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Abort the task and wait until it is gone.  No fetch starts and no
    /// result is delivered after this returns.
    pub async fn cancel(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
        debug!("poller: cancelled");
    }
}

impl Drop for MetadataPoller {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    source: Arc<dyn MetadataSource>,
    sink: Weak<dyn MetadataSink>,
    period: Duration,
    wake: Arc<Notify>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = wake.notified() => {
                debug!("poller: poked");
                ticker.reset();
            }
        }

        let Some(target) = sink.upgrade() else {
            debug!("poller: owner dropped, exiting");
            break;
        };

        match source.fetch().await {
            Ok(song) => target.apply_metadata(song).await,
            Err(e) => warn!("poller: keeping current track, fetch failed: {}", e),
        }
    }
}

#[cfg(test)]
pub mod testing {
    //! Scripted metadata source shared by the daemon's tests.

    use super::*;
    use nowplaying_proto::metadata::MetadataError;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays queued results, then repeats `fallback` forever.
    pub struct ScriptedSource {
        script: Mutex<VecDeque<Result<SongMetadata, MetadataError>>>,
        fallback: Mutex<Option<SongMetadata>>,
        delay: Mutex<Option<Duration>>,
        fetches: AtomicUsize,
    }

    impl ScriptedSource {
        pub fn new() -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                fallback: Mutex::new(None),
                delay: Mutex::new(None),
                fetches: AtomicUsize::new(0),
            }
        }

        pub fn push_ok(&self, song: SongMetadata) {
            self.script.lock().unwrap().push_back(Ok(song));
        }

        pub fn push_malformed(&self) {
            self.script
                .lock()
                .unwrap()
                .push_back(Err(MetadataError::Malformed("missing now_playing".into())));
        }

        pub fn always(&self, song: SongMetadata) {
            *self.fallback.lock().unwrap() = Some(song);
        }

        pub fn set_delay(&self, delay: Duration) {
            *self.delay.lock().unwrap() = Some(delay);
        }

        pub fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MetadataSource for ScriptedSource {
        async fn fetch(&self) -> Result<SongMetadata, MetadataError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(result) => result,
                None => self
                    .fallback
                    .lock()
                    .unwrap()
                    .clone()
                    .ok_or_else(|| MetadataError::Malformed("empty script".into())),
            }
        }
    }

    pub fn song(title: &str) -> SongMetadata {
        SongMetadata {
            title: title.to_string(),
            artist: "Artist".to_string(),
            artwork_url: "https://img.test/cover.jpg".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{song, ScriptedSource};
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        applied: Mutex<Vec<SongMetadata>>,
    }

    #[async_trait]
    impl MetadataSink for RecordingSink {
        async fn apply_metadata(&self, song: SongMetadata) {
            self.applied.lock().unwrap().push(song);
        }
    }

    fn weak_sink(sink: &Arc<RecordingSink>) -> Weak<dyn MetadataSink> {
        let sink: Arc<dyn MetadataSink> = sink.clone();
        Arc::downgrade(&sink)
    }

    #[tokio::test(start_paused = true)]
    async fn fetches_once_per_period() {
        let source = Arc::new(ScriptedSource::new());
        source.always(song("loop"));
        let sink = Arc::new(RecordingSink::default());
        let poller = MetadataPoller::spawn(source.clone(), weak_sink(&sink), Duration::from_secs(20));

        tokio::time::sleep(Duration::from_secs(19)).await;
        assert_eq!(source.fetches(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(source.fetches(), 1);

        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(source.fetches(), 3);
        assert_eq!(sink.applied.lock().unwrap().len(), 3);

        poller.cancel().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_keeps_polling() {
        let source = Arc::new(ScriptedSource::new());
        source.push_malformed();
        source.push_ok(song("second"));
        let sink = Arc::new(RecordingSink::default());
        let poller = MetadataPoller::spawn(source.clone(), weak_sink(&sink), Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(source.fetches(), 2);
        let applied = sink.applied.lock().unwrap().clone();
        assert_eq!(applied, vec![song("second")]);

        poller.cancel().await;
    }

    #[tokio::test(start_paused = true)]
    async fn no_fetch_after_cancel() {
        let source = Arc::new(ScriptedSource::new());
        source.always(song("x"));
        let sink = Arc::new(RecordingSink::default());
        let poller = MetadataPoller::spawn(source.clone(), weak_sink(&sink), Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(source.fetches(), 1);
        poller.cancel().await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(source.fetches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_in_flight_result() {
        let source = Arc::new(ScriptedSource::new());
        source.always(song("late"));
        source.set_delay(Duration::from_secs(3));
        let sink = Arc::new(RecordingSink::default());
        let poller = MetadataPoller::spawn(source.clone(), weak_sink(&sink), Duration::from_secs(5));

        // fetch is in flight between t=5 and t=8
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(source.fetches(), 1);
        poller.cancel().await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(sink.applied.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn poke_fetches_immediately() {
        let source = Arc::new(ScriptedSource::new());
        source.always(song("poked"));
        let sink = Arc::new(RecordingSink::default());
        let poller = MetadataPoller::spawn(source.clone(), weak_sink(&sink), Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(1)).await;
        poller.poke();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(source.fetches(), 1);

        poller.cancel().await;
    }

    #[tokio::test(start_paused = true)]
    async fn exits_when_sink_is_dropped() {
        let source = Arc::new(ScriptedSource::new());
        source.always(song("x"));
        let sink = Arc::new(RecordingSink::default());
        let poller = MetadataPoller::spawn(source.clone(), weak_sink(&sink), Duration::from_secs(5));
        drop(sink);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(poller.is_finished());
        assert_eq!(source.fetches(), 0);
    }
}
