//! Speak pipeline: cache lookup → synthesis on miss → store → enqueue.
//!
//! `speak()` never blocks the caller. Each request becomes a tokio task;
//! network work is capped by a semaphore and aborted when the shutdown
//! token fires. Identical concurrent requests are not de-duplicated.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::cache::{AudioCache, CacheKey};
use crate::config::VoiceConfig;
use crate::playback::PlaybackQueue;
use crate::synth::Synthesizer;

const MAX_CONCURRENT_SYNTHESES: usize = 4;
const PREVIEW_CHARS: usize = 40;

/// What happened to a single `speak()` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeakOutcome {
    CacheHit(PathBuf),
    Synthesized(PathBuf),
    Failed,
    /// Blank text.
    Skipped,
    Cancelled,
}

/// Latest pipeline event, for display.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SpeakStatus {
    #[default]
    Ready,
    Synthesizing(String),
    Queued(String),
    Failed(String),
}

impl fmt::Display for SpeakStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "Ready"),
            Self::Synthesizing(text) => write!(f, "Synthesizing \"{text}\""),
            Self::Queued(text) => write!(f, "Queued \"{text}\""),
            Self::Failed(reason) => write!(f, "Failed: {reason}"),
        }
    }
}

fn preview(text: &str) -> String {
    let short: String = text.chars().take(PREVIEW_CHARS).collect();
    if text.chars().count() > PREVIEW_CHARS {
        format!("{}...", short.replace('\n', " "))
    } else {
        short.replace('\n', " ")
    }
}

struct Inner {
    voice: RwLock<Arc<VoiceConfig>>,
    synth: Arc<dyn Synthesizer>,
    queue: PlaybackQueue,
    runtime: Handle,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    status: watch::Sender<SpeakStatus>,
}

#[derive(Clone)]
pub struct Speaker {
    inner: Arc<Inner>,
}

impl Speaker {
    pub fn new(
        voice: VoiceConfig,
        synth: Arc<dyn Synthesizer>,
        queue: PlaybackQueue,
        runtime: Handle,
        shutdown: CancellationToken,
    ) -> Self {
        let (status, _) = watch::channel(SpeakStatus::Ready);
        Self {
            inner: Arc::new(Inner {
                voice: RwLock::new(Arc::new(voice)),
                synth,
                queue,
                runtime,
                permits: Arc::new(Semaphore::new(MAX_CONCURRENT_SYNTHESES)),
                shutdown,
                status,
            }),
        }
    }

    pub fn voice_config(&self) -> Arc<VoiceConfig> {
        match self.inner.voice.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the voice config. Requests already running keep the old one.
    pub fn set_voice_config(&self, voice: VoiceConfig) {
        let voice = Arc::new(voice);
        match self.inner.voice.write() {
            Ok(mut guard) => *guard = voice,
            Err(poisoned) => *poisoned.into_inner() = voice,
        }
        info!("Voice config replaced");
    }

    pub fn subscribe(&self) -> watch::Receiver<SpeakStatus> {
        self.inner.status.subscribe()
    }

    /// Queue `text` for speaking and return immediately.
    ///
    /// The returned handle may be dropped; the request still runs.
    pub fn speak(&self, text: &str) -> JoinHandle<SpeakOutcome> {
        let inner = self.inner.clone();
        let voice = self.voice_config();
        let text = text.to_string();
        self.inner
            .runtime
            .spawn(async move { inner.run(&text, &voice).await })
    }
}

impl Inner {
    fn publish(&self, status: SpeakStatus) {
        self.status.send_replace(status);
    }

    async fn run(&self, text: &str, voice: &VoiceConfig) -> SpeakOutcome {
        if text.trim().is_empty() {
            return SpeakOutcome::Skipped;
        }

        let cache = AudioCache::for_voice(voice);
        let key = CacheKey::derive(voice, text);

        if let Some(path) = cache.lookup(&key) {
            debug!("Cache hit {key} for \"{}\"", preview(text));
            self.queue.enqueue(path.clone());
            self.publish(SpeakStatus::Queued(preview(text)));
            return SpeakOutcome::CacheHit(path);
        }

        let _permit = tokio::select! {
            _ = self.shutdown.cancelled() => return SpeakOutcome::Cancelled,
            permit = self.permits.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => return SpeakOutcome::Cancelled,
            },
        };

        info!("Cache miss {key}, synthesizing \"{}\"", preview(text));
        self.publish(SpeakStatus::Synthesizing(preview(text)));

        let result = tokio::select! {
            _ = self.shutdown.cancelled() => {
                info!("Synthesis of \"{}\" cancelled by shutdown", preview(text));
                return SpeakOutcome::Cancelled;
            }
            result = self.synth.synthesize(text, voice) => result,
        };

        let bytes = match result {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Dropping \"{}\": {e}", preview(text));
                self.publish(SpeakStatus::Failed(e.to_string()));
                return SpeakOutcome::Failed;
            }
        };

        let stored = {
            let (cache, key) = (cache.clone(), key.clone());
            tokio::task::spawn_blocking(move || cache.store(&key, &bytes))
                .await
                .unwrap_or_else(|e| Err(io::Error::other(e)))
        };
        match stored {
            Ok(path) => {
                info!("Audio saved to {}", path.display());
                self.queue.enqueue(path.clone());
                self.publish(SpeakStatus::Queued(preview(text)));
                SpeakOutcome::Synthesized(path)
            }
            Err(e) => {
                error!("Failed to cache audio in {}: {e}", cache.dir().display());
                self.publish(SpeakStatus::Failed(format!("cache write failed: {e}")));
                SpeakOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SynthesisError;
    use async_trait::async_trait;
    use crossbeam_channel::Receiver;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    #[derive(Default)]
    struct CountingSynth {
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl Synthesizer for CountingSynth {
        async fn synthesize(
            &self,
            text: &str,
            _voice: &VoiceConfig,
        ) -> Result<Vec<u8>, SynthesisError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(SynthesisError::Api {
                    status: 401,
                    body: "bad token".into(),
                });
            }
            Ok(format!("audio:{text}").into_bytes())
        }
    }

    fn speaker(
        synth: Arc<CountingSynth>,
        dir: &std::path::Path,
    ) -> (Speaker, Receiver<PathBuf>, CancellationToken) {
        let (queue, rx) = PlaybackQueue::channel();
        let token = CancellationToken::new();
        let speaker = Speaker::new(
            VoiceConfig::for_tests(dir),
            synth,
            queue,
            Handle::current(),
            token.clone(),
        );
        (speaker, rx, token)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_second_identical_call_hits_cache() {
        let dir = tempdir().unwrap();
        let synth = Arc::new(CountingSynth::default());
        let (speaker, rx, _token) = speaker(synth.clone(), dir.path());

        let path = match speaker.speak("hello").await.unwrap() {
            SpeakOutcome::Synthesized(path) => path,
            other => panic!("expected synthesis, got {other:?}"),
        };
        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
        assert_eq!(rx.try_recv().unwrap(), path);

        let second = speaker.speak("hello").await.unwrap();
        assert_eq!(second, SpeakOutcome::CacheHit(path.clone()));
        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);
        assert_eq!(rx.try_recv().unwrap(), path);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_speak_returns_before_synthesis_completes() {
        let dir = tempdir().unwrap();
        let synth = Arc::new(CountingSynth {
            delay: Duration::from_secs(2),
            ..Default::default()
        });
        let (speaker, rx, _token) = speaker(synth, dir.path());

        let start = Instant::now();
        let handle = speaker.speak("slow");
        assert!(start.elapsed() < Duration::from_millis(200));
        assert!(rx.try_recv().is_err());

        assert!(matches!(handle.await.unwrap(), SpeakOutcome::Synthesized(_)));
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_synthesis_enqueues_nothing() {
        let dir = tempdir().unwrap();
        let synth = Arc::new(CountingSynth {
            fail: true,
            ..Default::default()
        });
        let (speaker, rx, _token) = speaker(synth, dir.path());
        let status = speaker.subscribe();

        assert_eq!(speaker.speak("hello").await.unwrap(), SpeakOutcome::Failed);
        assert!(rx.try_recv().is_err());
        assert_eq!(std::fs::read_dir(dir.path()).map(|d| d.count()).unwrap_or(0), 0);
        assert!(matches!(&*status.borrow(), SpeakStatus::Failed(reason) if reason.contains("401")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_cancels_in_flight_request() {
        let dir = tempdir().unwrap();
        let synth = Arc::new(CountingSynth {
            delay: Duration::from_secs(30),
            ..Default::default()
        });
        let (speaker, rx, token) = speaker(synth.clone(), dir.path());

        let handle = speaker.speak("never");
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("request should stop promptly")
            .unwrap();
        assert_eq!(outcome, SpeakOutcome::Cancelled);
        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unwritable_cache_fails_without_enqueue() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let synth = Arc::new(CountingSynth::default());
        let (speaker, rx, _token) = speaker(synth.clone(), &blocker);
        let status = speaker.subscribe();

        assert_eq!(speaker.speak("hello").await.unwrap(), SpeakOutcome::Failed);
        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);
        assert!(rx.try_recv().is_err());
        assert!(matches!(
            &*status.borrow(),
            SpeakStatus::Failed(reason) if reason.starts_with("cache write failed")
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_blank_text_is_skipped() {
        let dir = tempdir().unwrap();
        let synth = Arc::new(CountingSynth::default());
        let (speaker, _rx, _token) = speaker(synth.clone(), dir.path());

        assert_eq!(speaker.speak("  \n").await.unwrap(), SpeakOutcome::Skipped);
        assert_eq!(synth.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_identical_misses_each_synthesize() {
        let dir = tempdir().unwrap();
        let synth = Arc::new(CountingSynth {
            delay: Duration::from_millis(200),
            ..Default::default()
        });
        let (speaker, rx, _token) = speaker(synth.clone(), dir.path());

        let a = speaker.speak("same");
        let b = speaker.speak("same");
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        assert_eq!(synth.calls.load(Ordering::SeqCst), 2);
        assert_eq!(a, b);
        assert_eq!(rx.try_iter().count(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_voice_change_uses_new_cache_key() {
        let dir = tempdir().unwrap();
        let synth = Arc::new(CountingSynth::default());
        let (speaker, _rx, _token) = speaker(synth.clone(), dir.path());

        speaker.speak("hello").await.unwrap();
        let mut voice = (*speaker.voice_config()).clone();
        voice.speed = 20;
        speaker.set_voice_config(voice);
        assert!(matches!(
            speaker.speak("hello").await.unwrap(),
            SpeakOutcome::Synthesized(_)
        ));
        assert_eq!(synth.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_preview_truncates_long_text() {
        let long = "x".repeat(100);
        assert_eq!(preview(&long), format!("{}...", "x".repeat(PREVIEW_CHARS)));
        assert_eq!(preview("a\nb"), "a b");
    }
}
