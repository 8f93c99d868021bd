//! Background producer of RSA deploy keys.
//!
//! Key generation is the slowest step of the poll loop, so a producer
//! keeps a bounded buffer of pre-generated keys and the loop only ever
//! receives. A blocked send is released by cancellation, which also ends
//! the producer.

use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use snake_core::sshkey::SshKey;

pub struct KeyPool {
    rx: Mutex<mpsc::Receiver<SshKey>>,
}

impl KeyPool {
    /// Spawn the producer with room for `capacity` buffered keys of the
    /// given modulus size. Returns the pool and the producer handle.
    pub fn start(
        token: CancellationToken,
        capacity: usize,
        bits: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(produce(token, tx, bits));
        (Self { rx: Mutex::new(rx) }, handle)
    }

    /// Take one pre-generated key. Returns `None` once the producer has
    /// stopped and the buffer is drained.
    pub async fn recv(&self) -> Option<SshKey> {
        self.rx.lock().await.recv().await
    }
}

async fn produce(token: CancellationToken, tx: mpsc::Sender<SshKey>, bits: usize) {
    loop {
        let generated = tokio::task::spawn_blocking(move || SshKey::generate(bits)).await;

        let key = match generated {
            Ok(Ok(key)) => key,
            Ok(Err(err)) => {
                error!(error = %err, "Unable to generate ssh key");
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                }
            }
            Err(err) => {
                error!(error = %err, "Key generation task failed");
                return;
            }
        };

        tokio::select! {
            _ = token.cancelled() => return,
            sent = tx.send(key) => {
                if sent.is_err() {
                    return;
                }
                debug!("Ssh key generated and buffered");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snake_core::sshkey::DEFAULT_BIT_SIZE;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_recv_yields_generated_key() {
        let token = CancellationToken::new();
        let (pool, producer) = KeyPool::start(token.clone(), 1, DEFAULT_BIT_SIZE);

        let key = pool.recv().await.expect("producer should yield a key");
        assert!(key.public.starts_with("ssh-rsa "));

        token.cancel();
        producer.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancellation_releases_blocked_send() {
        let token = CancellationToken::new();
        // Capacity 1: once the buffer holds a key, the producer blocks on
        // the send of the next one.
        let (pool, producer) = KeyPool::start(token.clone(), 1, DEFAULT_BIT_SIZE);

        pool.recv().await.expect("first key");

        token.cancel();
        producer.await.unwrap();
    }
}
