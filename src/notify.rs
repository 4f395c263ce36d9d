use async_trait::async_trait;
use serenity::all::ChannelId;
use serenity::http::Http;
use std::sync::Arc;
use tracing::warn;

/// Destino de mensajes de progreso de texto libre hacia quien invocó
/// la operación (la capa de UI decide qué hacer con ellos).
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn notify(&self, message: &str);
}

/// Publica el progreso en un canal de texto de Discord.
pub struct ChannelNotifier {
    http: Arc<Http>,
    channel_id: ChannelId,
}

impl ChannelNotifier {
    pub fn new(http: Arc<Http>, channel_id: ChannelId) -> Self {
        Self { http, channel_id }
    }
}

#[async_trait]
impl ProgressSink for ChannelNotifier {
    async fn notify(&self, message: &str) {
        if let Err(e) = self.channel_id.say(&self.http, message).await {
            warn!("No se pudo enviar la notificación de progreso: {:?}", e);
        }
    }
}

/// Sink nulo para contextos sin canal de destino.
#[allow(dead_code)]
pub struct NullSink;

#[async_trait]
impl ProgressSink for NullSink {
    async fn notify(&self, _message: &str) {}
}
