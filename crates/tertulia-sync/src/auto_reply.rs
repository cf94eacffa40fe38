//! Mention-triggered automated replies.
//!
//! A reply is an ordinary backend write under the bot identity; it reaches the
//! view through the live feed like any other message.

use std::{sync::Arc, time::Duration};

use rand::Rng;
use tertulia_core::{AutoReplyConfig, MessageContent, unix_time_ms};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{MessageDraft, MessagingBackend};

pub const CANNED_REPLIES: &[&str] = &[
    "¡Hola! Aquí estoy, ¿en qué te puedo ayudar?",
    "Gracias por escribir. Lo comparto con el resto de la comunidad.",
    "Buena pregunta. Echa un vistazo a la sección de Noticias.",
    "No te pierdas los próximos Eventos de la comunidad.",
    "¡Un saludo a todos los que nos leen desde fuera!",
];

/// Whether `content` mentions `trigger`, ignoring case.
pub fn mentions_trigger(content: &MessageContent, trigger: &str) -> bool {
    let trigger = trigger.trim();
    if trigger.is_empty() || content.is_system() {
        return false;
    }
    content
        .text()
        .is_some_and(|text| text.to_lowercase().contains(&trigger.to_lowercase()))
}

pub fn reply_delay(config: &AutoReplyConfig) -> Duration {
    let low = config.min_delay_ms.min(config.max_delay_ms);
    let high = config.min_delay_ms.max(config.max_delay_ms);
    Duration::from_millis(rand::rng().random_range(low..=high))
}

pub fn pick_reply() -> &'static str {
    CANNED_REPLIES[rand::rng().random_range(0..CANNED_REPLIES.len())]
}

/// Schedule one reply in `room`. Never blocks the caller.
pub fn spawn_auto_reply(
    backend: Arc<dyn MessagingBackend>,
    config: &AutoReplyConfig,
    room: String,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let delay = reply_delay(config);
    let author = config.author.clone();
    let body = pick_reply().to_owned();
    debug!(%room, delay_ms = delay.as_millis() as u64, "auto reply scheduled");

    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let draft = MessageDraft {
            room: room.clone(),
            author,
            content: MessageContent::Text { body },
            created_at_ms: unix_time_ms(),
            client_txn_id: None,
        };
        match backend.insert_message(draft).await {
            Ok(row) => debug!(%room, message_id = %row.id, "auto reply stored"),
            Err(err) => warn!(%room, error = %err, "auto reply write failed"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBackend;
    use tertulia_core::MediaKind;
    use tokio::time::timeout;

    fn text(body: &str) -> MessageContent {
        MessageContent::Text {
            body: body.to_owned(),
        }
    }

    #[test]
    fn trigger_match_ignores_case() {
        assert!(mentions_trigger(&text("Hola @Bot, ¿qué tal?"), "@bot"));
        assert!(mentions_trigger(&text("@BOT"), "@bot"));
        assert!(!mentions_trigger(&text("robot"), "@bot"));
        assert!(!mentions_trigger(&text("@bot"), "  "));
        assert!(!mentions_trigger(
            &MessageContent::System {
                body: "@bot".into()
            },
            "@bot"
        ));
    }

    #[test]
    fn trigger_matches_media_caption() {
        let content = MessageContent::Media {
            url: "https://cdn.example.org/a.png".into(),
            kind: MediaKind::Image,
            caption: Some("mira esto @bot".into()),
        };
        assert!(mentions_trigger(&content, "@bot"));
    }

    #[test]
    fn delay_stays_within_bounds() {
        let config = AutoReplyConfig::default();
        for _ in 0..100 {
            let delay = reply_delay(&config);
            assert!(delay >= Duration::from_millis(1_500));
            assert!(delay <= Duration::from_millis(4_000));
        }

        let inverted = AutoReplyConfig {
            min_delay_ms: 20,
            max_delay_ms: 10,
            ..AutoReplyConfig::default()
        };
        let delay = reply_delay(&inverted);
        assert!(delay >= Duration::from_millis(10) && delay <= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn writes_reply_under_bot_identity() {
        let backend = InMemoryBackend::new();
        let config = AutoReplyConfig {
            min_delay_ms: 0,
            max_delay_ms: 5,
            ..AutoReplyConfig::default()
        };

        let task = spawn_auto_reply(
            Arc::new(backend.clone()),
            &config,
            "General".into(),
            CancellationToken::new(),
        );
        timeout(Duration::from_secs(2), task)
            .await
            .expect("reply timeout")
            .expect("reply task should not panic");

        let rows = backend.rows("General");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].author_id, "bot");
        assert_eq!(rows[0].author_name, "Asistente");
        assert!(
            rows[0]
                .content
                .text()
                .is_some_and(|body| CANNED_REPLIES.contains(&body))
        );
    }

    #[tokio::test]
    async fn shutdown_cancels_scheduled_reply() {
        let backend = InMemoryBackend::new();
        let shutdown = CancellationToken::new();
        let task = spawn_auto_reply(
            Arc::new(backend.clone()),
            &AutoReplyConfig::default(),
            "General".into(),
            shutdown.clone(),
        );

        shutdown.cancel();
        timeout(Duration::from_secs(2), task)
            .await
            .expect("cancel timeout")
            .expect("reply task should not panic");
        assert!(backend.rows("General").is_empty());
    }
}
