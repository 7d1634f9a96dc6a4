use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use async_trait::async_trait;
use bytes::BytesMut;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time;
use tokio::time::Instant;
use transport::config::FlowControlKind;
use transport::{Message, Outgoing, ReliableConfig, ReliableInputStream, ReliableOutputStream};

#[derive(Clone)]
enum Target {
    Input(Weak<ReliableInputStream>),
    Output(Weak<ReliableOutputStream>),
}

/// A simulated wire: drops a share of all messages, and delivers the rest after a random
///  delay (which reorders them). Messages go through their binary encoding on the way.
struct LossyLink {
    rng: Mutex<StdRng>,
    loss_rate: f64,
    target: OnceLock<Target>,
    num_sent: AtomicUsize,
    num_dropped: AtomicUsize,
    last_accessed: Mutex<Instant>,
}

impl LossyLink {
    fn new(seed: u64, loss_rate: f64) -> LossyLink {
        LossyLink {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            loss_rate,
            target: OnceLock::new(),
            num_sent: AtomicUsize::new(0),
            num_dropped: AtomicUsize::new(0),
            last_accessed: Mutex::new(Instant::now()),
        }
    }

    fn connect(&self, target: Target) {
        assert!(self.target.set(target).is_ok());
    }

    fn num_dropped(&self) -> usize {
        self.num_dropped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Outgoing for LossyLink {
    async fn send(&self, message: Message) -> anyhow::Result<()> {
        self.num_sent.fetch_add(1, Ordering::SeqCst);

        let (is_lost, delay) = {
            let mut rng = self.rng.lock().unwrap();
            (rng.gen_bool(self.loss_rate), Duration::from_millis(rng.gen_range(1..40)))
        };
        if is_lost {
            self.num_dropped.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }

        let mut buf = BytesMut::new();
        message.ser(&mut buf);
        let mut wire = buf.freeze();

        let target = self.target.get().cloned().expect("link is not connected");
        tokio::spawn(async move {
            time::sleep(delay).await;
            let message = Message::deser(&mut wire).expect("message does not survive the wire");
            match target {
                Target::Input(input) => if let Some(input) = input.upgrade() {
                    input.recv(&message).await;
                },
                Target::Output(output) => if let Some(output) = output.upgrade() {
                    output.recv(&message).await;
                },
            }
        });
        Ok(())
    }

    async fn close(&self) {}

    fn min_idle_reconnect_time(&self) -> Duration {
        Duration::from_secs(10)
    }

    fn idle_timeout(&self) -> Duration {
        Duration::from_secs(3600)
    }

    fn max_retry_age(&self) -> Duration {
        Duration::from_secs(3600)
    }

    fn last_accessed(&self) -> Instant {
        *self.last_accessed.lock().unwrap()
    }

    fn set_last_accessed(&self, at: Instant) {
        *self.last_accessed.lock().unwrap() = at;
    }
}

fn config(flow_control: FlowControlKind, max_queue_size: u32) -> Arc<ReliableConfig> {
    Arc::new(ReliableConfig {
        chunk_size: 1024,
        max_queue_size,
        min_rto: Duration::from_millis(200),
        flow_control,
        ..ReliableConfig::default()
    })
}

/// `read_delay` is the time the reader spends with each chunk before it asks for the next one
async fn transfer(config: Arc<ReliableConfig>, seed: u64, read_delay: Option<Duration>) {
    let data_link = Arc::new(LossyLink::new(seed, 0.1));
    let ack_link = Arc::new(LossyLink::new(seed + 1, 0.1));

    let output = Arc::new(ReliableOutputStream::new(config.clone(), data_link.clone()).unwrap());
    let input = Arc::new(ReliableInputStream::new(config.clone(), ack_link.clone()).unwrap());
    data_link.connect(Target::Input(Arc::downgrade(&input)));
    ack_link.connect(Target::Output(Arc::downgrade(&output)));

    let data = (0..200_000u32)
        .map(|i| (i % 251) as u8)
        .collect::<Vec<_>>();

    let writer = {
        let output = output.clone();
        let data = data.clone();
        tokio::spawn(async move {
            output.write(&data).await?;
            output.close().await
        })
    };

    let reader = {
        let input = input.clone();
        async move {
            let mut received = Vec::new();
            while let Some(chunk) = input.read_message().await? {
                received.extend_from_slice(&chunk);
                if let Some(delay) = read_delay {
                    time::sleep(delay).await;
                }
            }
            Ok::<_, transport::TransportError>(received)
        }
    };

    let received = time::timeout(Duration::from_secs(3600), reader).await
        .expect("transfer did not finish")
        .unwrap();
    assert_eq!(received.len(), data.len());
    assert!(received == data);
    assert!(input.is_end_of_stream().await);

    time::timeout(Duration::from_secs(3600), writer).await
        .expect("close did not finish")
        .unwrap()
        .unwrap();
    assert_eq!(output.queue_len().await, 0);

    assert!(data_link.num_dropped() > 0);
    assert!(output.retransmit_count().await > 0);
}

#[tokio::test(start_paused = true)]
async fn test_lossy_link_adaptive() {
    transfer(config(FlowControlKind::Adaptive { initial_rwindow: 2 }, 100), 17, None).await;
}

#[tokio::test(start_paused = true)]
async fn test_lossy_link_fixed() {
    transfer(config(FlowControlKind::Fixed { rwindow: 16 }, 100), 4711, None).await;
}

#[tokio::test(start_paused = true)]
async fn test_lossy_link_small_receive_queue_and_slow_reader() {
    transfer(config(FlowControlKind::Fixed { rwindow: 4 }, 4), 99, Some(Duration::from_millis(20))).await;
}
