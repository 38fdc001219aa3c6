use async_trait::async_trait;
use nudge_domain::{
    notifications::{DeliveryChannel, NotificationMessage},
    DeliveryError,
};
use tokio::io::{AsyncWrite, AsyncWriteExt, Stdout};
use tokio::sync::Mutex;
use tracing::info;

/// Prints reminders as plain lines to any async writer.
pub struct ConsoleChannel<W> {
    out: Mutex<W>,
}

impl ConsoleChannel<Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W> ConsoleChannel<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

pub fn render(message: &NotificationMessage) -> String {
    format!(
        "[reminder] {} (due {}, ack with: done {})\n",
        message.text,
        message.scheduled_for.format("%Y-%m-%d %H:%M UTC"),
        message.occurrence_id
    )
}

#[async_trait]
impl<W> DeliveryChannel for ConsoleChannel<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, message: &NotificationMessage) -> Result<(), DeliveryError> {
        let line = render(message);
        let mut out = self.out.lock().await;
        out.write_all(line.as_bytes())
            .await
            .map_err(|err| DeliveryError::Unavailable(err.to_string()))?;
        out.flush()
            .await
            .map_err(|err| DeliveryError::Unavailable(err.to_string()))?;
        info!(
            owner = %message.owner,
            occurrence = %message.occurrence_id,
            "reminder printed"
        );
        Ok(())
    }
}
