// src/publisher.rs
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use uuid::Uuid;

use crate::channel::{ChannelProducer, Position};
use crate::error::PublishError;
use crate::model::{user_key, Article, EventKind, NotificationEnvelope, UserId, SYSTEM_TOPIC};

/// Turns delivery intents into envelopes on the notification topic.
pub struct Publisher {
    producer: Arc<dyn ChannelProducer>,
    topic: String,
    timeout: Duration,
}

impl Publisher {
    pub fn new(producer: Arc<dyn ChannelProducer>, topic: &str, timeout: Duration) -> Self {
        Self {
            producer,
            topic: topic.to_string(),
            timeout,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Enqueue one (user, article) notification keyed by the user.
    pub async fn publish(
        &self,
        user_id: UserId,
        keyword: &str,
        article: &Article,
    ) -> Result<NotificationEnvelope, PublishError> {
        let env = envelope(EventKind::Notification, user_id, keyword, article.clone());
        self.enqueue(user_id, &env).await?;
        Ok(env)
    }

    /// Enqueue a free-form system message for one user.
    pub async fn publish_message(
        &self,
        user_id: UserId,
        message: &str,
    ) -> Result<NotificationEnvelope, PublishError> {
        let article = Article {
            source: "System".to_string(),
            author: "Notification Service".to_string(),
            title: message.to_string(),
            description: message.to_string(),
            published_at: Some(Utc::now()),
            ..Article::default()
        };
        let env = envelope(EventKind::SystemNotification, user_id, SYSTEM_TOPIC, article);
        self.enqueue(user_id, &env).await?;
        Ok(env)
    }

    async fn enqueue(
        &self,
        user_id: UserId,
        env: &NotificationEnvelope,
    ) -> Result<Position, PublishError> {
        let res = self.try_enqueue(user_id, env).await;
        match &res {
            Ok(pos) => {
                counter!("publisher_envelopes_total").increment(1);
                tracing::debug!(
                    target: "publisher",
                    event_id = %env.event_id,
                    user_id,
                    partition = pos.partition,
                    offset = pos.offset,
                    "envelope enqueued"
                );
            }
            Err(_) => counter!("publisher_errors_total").increment(1),
        }
        res
    }

    async fn try_enqueue(
        &self,
        user_id: UserId,
        env: &NotificationEnvelope,
    ) -> Result<Position, PublishError> {
        let payload = env.encode()?;
        let key = user_key(user_id);
        match tokio::time::timeout(
            self.timeout,
            self.producer.send(&self.topic, &key, payload),
        )
        .await
        {
            Ok(res) => Ok(res?),
            Err(_) => Err(PublishError::Timeout(self.timeout)),
        }
    }
}

fn envelope(
    kind: EventKind,
    user_id: UserId,
    keyword: &str,
    article: Article,
) -> NotificationEnvelope {
    NotificationEnvelope {
        event_id: Uuid::new_v4().to_string(),
        event_type: kind,
        keyword: keyword.to_string(),
        article,
        enqueued_at: Utc::now(),
        user_id: Some(user_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LogBroker;

    #[tokio::test]
    async fn event_ids_are_unique_per_publish() {
        let broker = LogBroker::in_memory(4);
        let publisher = Publisher::new(Arc::new(broker.clone()), "n", Duration::from_secs(1));
        let art = Article {
            title: "same".into(),
            ..Article::default()
        };
        let a = publisher.publish(7, "rust", &art).await.unwrap();
        let b = publisher.publish(7, "rust", &art).await.unwrap();
        assert_ne!(a.event_id, b.event_id);
        assert_eq!(broker.read_topic("n").len(), 2);
    }

    #[tokio::test]
    async fn system_message_shape() {
        let broker = LogBroker::in_memory(1);
        let publisher = Publisher::new(Arc::new(broker.clone()), "n", Duration::from_secs(1));
        let env = publisher.publish_message(3, "maintenance tonight").await.unwrap();
        assert_eq!(env.event_type, EventKind::SystemNotification);
        assert_eq!(env.keyword, SYSTEM_TOPIC);
        assert_eq!(env.article.source, "System");
        assert_eq!(env.article.description, "maintenance tonight");

        let rec = &broker.read_topic("n")[0];
        assert_eq!(rec.key, "user_3");
        assert_eq!(NotificationEnvelope::decode(&rec.payload).unwrap(), env);
    }

    #[tokio::test]
    async fn closed_channel_is_reported() {
        let broker = LogBroker::in_memory(1);
        broker.close();
        let publisher = Publisher::new(Arc::new(broker), "n", Duration::from_secs(1));
        let err = publisher
            .publish(1, "rust", &Article::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Channel(_)));
    }
}
