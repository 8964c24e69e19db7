//! Ordered parallel TTS pipeline (spec §4.9). Synthesizes up to
//! `maxParallel` chunks concurrently but always delivers audio to the
//! client in ascending index order, and survives cancel/reset cycles
//! during in-flight synthesis via a generation counter.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, oneshot};

use crate::tts::router::TtsRouter;
use crate::wav;

const DEFAULT_MAX_PARALLEL: u32 = 2;
const DRAIN_SAFETY_TIMEOUT: Duration = Duration::from_secs(30);

/// Events the pipeline emits to the owning Turn / connection handler.
#[derive(Debug)]
pub enum TtsPipelineEvent {
    Meta {
        index: u32,
        sample_rate: u32,
        duration_ms: u64,
    },
    Audio(Vec<u8>),
    AllFailed,
    Done,
    Cancelled,
}

struct PendingChunk {
    text: String,
}

struct Inner {
    pending: HashMap<u32, PendingChunk>,
    completed: HashMap<u32, Vec<u8>>,
    failed: HashSet<u32>,
    failed_total: u32,
    total_chunks: u32,
    next_send_index: u32,
    in_flight: u32,
    cancelled: bool,
    generation: u64,
    drain_waiters: Vec<oneshot::Sender<()>>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
            completed: HashMap::new(),
            failed: HashSet::new(),
            failed_total: 0,
            total_chunks: 0,
            next_send_index: 0,
            in_flight: 0,
            cancelled: false,
            generation: 0,
            drain_waiters: Vec::new(),
        }
    }
}

pub struct TtsPipeline {
    router: Arc<TtsRouter>,
    state: Arc<Mutex<Inner>>,
    tx: mpsc::UnboundedSender<TtsPipelineEvent>,
    max_parallel: u32,
}

impl TtsPipeline {
    pub fn new(
        router: Arc<TtsRouter>,
    ) -> (Self, mpsc::UnboundedReceiver<TtsPipelineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                router,
                state: Arc::new(Mutex::new(Inner::default())),
                tx,
                max_parallel: DEFAULT_MAX_PARALLEL,
            },
            rx,
        )
    }

    /// Only used by the [`inFlight` never negative] test; exposed so
    /// integration tests can poll it directly.
    pub async fn in_flight(&self) -> u32 {
        self.state.lock().await.in_flight
    }

    /// `processChunk(text, index, turnId)` from spec §4.9.
    pub async fn process_chunk(&self, text: impl Into<String>, index: u32, _turn_id: impl Into<String>) {
        {
            let mut inner = self.state.lock().await;
            if inner.cancelled {
                return;
            }
            inner.total_chunks = inner.total_chunks.max(index + 1);
            inner.pending.insert(index, PendingChunk { text: text.into() });
        }
        dispatch(&self.state, &self.router, &self.tx, self.max_parallel).await;
    }

    /// `finish()` from spec §4.9.
    pub async fn finish(&self) {
        self.drain_all().await;
        let (emit_all_failed, total) = {
            let inner = self.state.lock().await;
            (
                !inner.cancelled && inner.failed_total == inner.total_chunks,
                inner.total_chunks,
            )
        };
        if emit_all_failed && total > 0 {
            let _ = self.tx.send(TtsPipelineEvent::AllFailed);
        }
        let _ = self.tx.send(TtsPipelineEvent::Done);
    }

    /// `drainAll()` from spec §4.9.
    async fn drain_all(&self) {
        let already_drained = {
            let inner = self.state.lock().await;
            inner.in_flight == 0 && inner.pending.is_empty()
        };
        if already_drained {
            send_in_order(&self.state, &self.tx).await;
            return;
        }

        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut inner = self.state.lock().await;
            inner.drain_waiters.push(done_tx);
        }
        let state = self.state.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DRAIN_SAFETY_TIMEOUT).await;
            send_in_order(&state, &tx).await;
            let waiters: Vec<_> = {
                let mut inner = state.lock().await;
                inner.drain_waiters.drain(..).collect()
            };
            for w in waiters {
                let _ = w.send(());
            }
        });
        let _ = done_rx.await;
    }

    /// `cancel()` from spec §4.9.
    pub async fn cancel(&self) {
        let waiters: Vec<_> = {
            let mut inner = self.state.lock().await;
            inner.cancelled = true;
            inner.pending.clear();
            inner.completed.clear();
            inner.drain_waiters.drain(..).collect()
        };
        let _ = self.tx.send(TtsPipelineEvent::Done);
        for w in waiters {
            let _ = w.send(());
        }
        let _ = self.tx.send(TtsPipelineEvent::Cancelled);
    }

    /// `reset()` from spec §4.9. Bumping `generation` is the invariant that
    /// lets stale completions from the previous episode be dropped without
    /// corrupting `inFlight`.
    pub async fn reset(&self) {
        let waiters: Vec<_> = {
            let mut inner = self.state.lock().await;
            inner.pending.clear();
            inner.completed.clear();
            inner.failed.clear();
            inner.failed_total = 0;
            inner.total_chunks = 0;
            inner.next_send_index = 0;
            inner.in_flight = 0;
            inner.cancelled = false;
            inner.generation = inner.generation.wrapping_add(1);
            inner.drain_waiters.drain(..).collect()
        };
        for w in waiters {
            let _ = w.send(());
        }
    }
}

fn dispatch<'a>(
    state: &'a Arc<Mutex<Inner>>,
    router: &'a Arc<TtsRouter>,
    tx: &'a mpsc::UnboundedSender<TtsPipelineEvent>,
    max_parallel: u32,
) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
    Box::pin(dispatch_inner(state, router, tx, max_parallel))
}

async fn dispatch_inner(
    state: &Arc<Mutex<Inner>>,
    router: &Arc<TtsRouter>,
    tx: &mpsc::UnboundedSender<TtsPipelineEvent>,
    max_parallel: u32,
) {
    loop {
        let next = {
            let mut inner = state.lock().await;
            if inner.cancelled || inner.in_flight >= max_parallel {
                None
            } else if let Some(index) = inner.pending.keys().next().copied() {
                let chunk = inner
                    .pending
                    .remove(&index)
                    .expect("index came from keys() of the same map");
                inner.in_flight += 1;
                Some((index, chunk, inner.generation))
            } else {
                None
            }
        };
        match next {
            Some((index, chunk, gen_)) => {
                let state = state.clone();
                let router = router.clone();
                let tx = tx.clone();
                let max_parallel = max_parallel;
                tokio::spawn(async move {
                    synthesize_and_queue(state, router, tx, chunk.text, index, gen_, max_parallel)
                        .await;
                });
            }
            None => break,
        }
    }
}

async fn synthesize_and_queue(
    state: Arc<Mutex<Inner>>,
    router: Arc<TtsRouter>,
    tx: mpsc::UnboundedSender<TtsPipelineEvent>,
    text: String,
    index: u32,
    gen_: u64,
    max_parallel: u32,
) {
    let result = router.synthesize(&text, None).await;

    let stale = {
        let inner = state.lock().await;
        gen_ != inner.generation
    };
    if stale {
        // Belongs to a superseded episode; drop silently, touch nothing.
        return;
    }

    {
        let mut inner = state.lock().await;
        match result {
            Ok(audio) => {
                inner.completed.insert(index, audio);
            }
            Err(_) => {
                inner.failed.insert(index);
                inner.failed_total += 1;
            }
        }
        inner.in_flight = inner.in_flight.saturating_sub(1);
    }

    send_in_order(&state, &tx).await;
    dispatch(&state, &router, &tx, max_parallel).await;
    check_drained(&state).await;
}

/// `sendInOrder()` from spec §4.9.
async fn send_in_order(state: &Arc<Mutex<Inner>>, tx: &mpsc::UnboundedSender<TtsPipelineEvent>) {
    let mut inner = state.lock().await;
    loop {
        if inner.cancelled {
            inner.completed.clear();
            return;
        }
        let next_send_index = inner.next_send_index;
        if let Some(audio) = inner.completed.remove(&next_send_index) {
            let info = wav::read_sample_rate(&audio);
            let duration_ms = wav::duration_ms(&audio, info.sample_rate);
            let index = inner.next_send_index;
            inner.next_send_index += 1;
            let _ = tx.send(TtsPipelineEvent::Meta {
                index,
                sample_rate: info.sample_rate,
                duration_ms,
            });
            let _ = tx.send(TtsPipelineEvent::Audio(audio));
            continue;
        }
        if inner.failed.remove(&next_send_index) {
            inner.next_send_index += 1;
            continue;
        }
        break;
    }
}

async fn check_drained(state: &Arc<Mutex<Inner>>) {
    let waiters: Vec<_> = {
        let mut inner = state.lock().await;
        if inner.in_flight == 0 && inner.pending.is_empty() {
            inner.drain_waiters.drain(..).collect()
        } else {
            Vec::new()
        }
    };
    for w in waiters {
        let _ = w.send(());
    }
}
