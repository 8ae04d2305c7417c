//! Fan-in of many message channels into one.

use tokio::sync::mpsc;

use crate::message::BUS_CAPACITY;

/// Merges `inputs` into a single receiver.
///
/// One forwarding task runs per input and ends when that input closes (or the merged
/// receiver is dropped). The merged channel closes once every forwarder has finished.
/// Each input's relative order is preserved; inputs interleave arbitrarily.
pub fn merge<T>(inputs: Vec<mpsc::Receiver<T>>) -> mpsc::Receiver<T>
where
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel(BUS_CAPACITY);
    for mut input in inputs {
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(item) = input.recv().await {
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });
    }
    rx
}
