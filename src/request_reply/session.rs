//! Multi-Session Manager
//!
//! Components that need independent broker identities request extra
//! controller instances, each with its own connection, reply topic/queue
//! and correlation space. Sessions are identified by opaque ids; the
//! default controller (session id absent) is always present.

use std::collections::HashMap;
use tokio::sync::Mutex;

use std::sync::Arc;

use crate::broker::BrokerConnectionConfig;
use crate::error::ProcessingError;
use crate::message::codec::{PayloadEncoding, PayloadFormat};
use crate::request_reply::controller::{
    Request, RequestOptions, RequestReplyController, Response,
};
use crate::request_reply::RequestReplySettings;

/// Point-in-time view of one session, as returned by `list_sessions`.
#[derive(Clone, Debug)]
pub struct SessionStatus {
    pub session_id: String,
    pub reply_topic: String,
    pub outstanding_requests: usize,
}

pub struct RequestReplyService {
    base_connection: BrokerConnectionConfig,
    settings: RequestReplySettings,
    encoding: PayloadEncoding,
    format: PayloadFormat,
    default_controller: Arc<RequestReplyController>,
    sessions: Mutex<HashMap<String, Arc<RequestReplyController>>>,
}

impl RequestReplyService {
    pub async fn start(
        connection: BrokerConnectionConfig,
        settings: RequestReplySettings,
        encoding: PayloadEncoding,
        format: PayloadFormat,
    ) -> anyhow::Result<Arc<Self>> {
        let default_controller =
            RequestReplyController::start(&connection, &settings, encoding, format).await?;
        Ok(Arc::new(Self {
            base_connection: connection,
            settings,
            encoding,
            format,
            default_controller,
            sessions: Mutex::new(HashMap::new()),
        }))
    }

    /// Open an additional controller; fails once `max_sessions` is
    /// reached.
    pub async fn create_session(
        &self,
        config_overrides: Option<BrokerConnectionConfig>,
    ) -> Result<String, ProcessingError> {
        {
            let sessions = self.sessions.lock().await;
            if sessions.len() >= self.settings.max_sessions {
                return Err(ProcessingError::SessionLimitExceeded(sessions.len()));
            }
        }

        let connection = config_overrides.unwrap_or_else(|| self.base_connection.clone());
        let controller =
            RequestReplyController::start(&connection, &self.settings, self.encoding, self.format)
                .await
                .map_err(|e| ProcessingError::Broker(format!("session start failed: {e}")))?;

        let session_id = uuid::Uuid::new_v4().to_string();
        let mut sessions = self.sessions.lock().await;
        if sessions.len() >= self.settings.max_sessions {
            // Lost the race against a concurrent create; undo.
            let count = sessions.len();
            drop(sessions);
            controller
                .stop(ProcessingError::SessionLimitExceeded(count))
                .await;
            return Err(ProcessingError::SessionLimitExceeded(count));
        }
        sessions.insert(session_id.clone(), controller);
        tracing::info!("request/reply session {session_id} created");
        Ok(session_id)
    }

    /// Tear down a session, failing its outstanding waiters with
    /// `SessionClosed`. Returns whether the session existed.
    pub async fn destroy_session(&self, session_id: &str) -> Result<bool, ProcessingError> {
        let controller = self.sessions.lock().await.remove(session_id);
        match controller {
            Some(controller) => {
                controller
                    .stop(ProcessingError::SessionClosed(session_id.to_string()))
                    .await;
                tracing::info!("request/reply session {session_id} destroyed");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn list_sessions(&self) -> Vec<SessionStatus> {
        let sessions = self.sessions.lock().await;
        sessions
            .iter()
            .map(|(session_id, controller)| SessionStatus {
                session_id: session_id.clone(),
                reply_topic: controller.reply_topic().to_string(),
                outstanding_requests: controller.outstanding_requests(),
            })
            .collect()
    }

    /// Route a request through the default controller or a named session.
    pub async fn do_request_response(
        &self,
        request: Request,
        options: RequestOptions,
        session_id: Option<&str>,
    ) -> Result<Response, ProcessingError> {
        let controller = match session_id {
            None => self.default_controller.clone(),
            Some(id) => self
                .sessions
                .lock()
                .await
                .get(id)
                .cloned()
                .ok_or_else(|| ProcessingError::SessionNotFound(id.to_string()))?,
        };
        controller.do_request_response(request, options).await
    }

    pub fn default_reply_topic(&self) -> String {
        self.default_controller.reply_topic().to_string()
    }

    pub async fn stop(&self) {
        let drained: Vec<(String, Arc<RequestReplyController>)> =
            self.sessions.lock().await.drain().collect();
        for (session_id, controller) in drained {
            controller
                .stop(ProcessingError::SessionClosed(session_id))
                .await;
        }
        self.default_controller
            .stop(ProcessingError::SessionClosed("default".to_string()))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerSession, TopicFilter, dev::DevSession};
    use crate::request_reply::{CORRELATION_ID_PROPERTY, REPLY_TOPIC_PROPERTY};
    use serde_json::{Map, Value, json};
    use tokio::time::Duration;

    fn dev_connection() -> BrokerConnectionConfig {
        BrokerConnectionConfig {
            url: format!("dev://{}", uuid::Uuid::new_v4()),
            ..Default::default()
        }
    }

    async fn service_on(
        connection: &BrokerConnectionConfig,
    ) -> Arc<RequestReplyService> {
        RequestReplyService::start(
            connection.clone(),
            RequestReplySettings::default(),
            PayloadEncoding::Utf8,
            PayloadFormat::Json,
        )
        .await
        .unwrap()
    }

    /// A responder that answers every request on `topic` by echoing the
    /// given chunk payloads back on the reply topic.
    async fn spawn_responder(
        connection: &BrokerConnectionConfig,
        topic: &str,
        chunks: Vec<Value>,
    ) {
        let session = DevSession::connect(connection);
        let rx = session
            .subscribe(&TopicFilter::parse(topic).unwrap())
            .await
            .unwrap();
        tokio::spawn(async move {
            while let Ok(received) = rx.recv_async().await {
                let reply_topic = received
                    .user_properties
                    .get(REPLY_TOPIC_PROPERTY)
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let cid = received
                    .user_properties
                    .get(CORRELATION_ID_PROPERTY)
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let (Some(reply_topic), Some(cid)) = (reply_topic, cid) else {
                    continue;
                };
                for chunk in &chunks {
                    let mut props = Map::new();
                    props.insert(CORRELATION_ID_PROPERTY.into(), json!(cid));
                    session
                        .publish(&reply_topic, chunk.to_string().as_bytes(), &props)
                        .await
                        .unwrap();
                }
            }
        });
    }

    #[tokio::test]
    async fn single_request_response() {
        let connection = dev_connection();
        spawn_responder(&connection, "svc/echo", vec![json!({"answer": 42})]).await;
        let service = service_on(&connection).await;

        let response = service
            .do_request_response(
                Request::new("svc/echo", json!({"question": "?"})),
                RequestOptions::default(),
                None,
            )
            .await
            .unwrap();

        match response {
            Response::Single(message) => assert_eq!(message.payload, json!({"answer": 42})),
            _ => panic!("expected a single response"),
        }
        service.stop().await;
    }

    #[tokio::test]
    async fn timeout_when_nobody_answers() {
        let connection = dev_connection();
        let service = service_on(&connection).await;

        let result = service
            .do_request_response(
                Request::new("svc/silent", json!({})),
                RequestOptions {
                    timeout_ms: Some(100),
                    ..Default::default()
                },
                None,
            )
            .await;

        assert!(matches!(result, Err(ProcessingError::Timeout(100))));
        // The waiter is gone; nothing is left outstanding.
        assert!(service.list_sessions().await.is_empty());
        service.stop().await;
    }

    #[tokio::test]
    async fn streaming_response_completes_on_expression() {
        let connection = dev_connection();
        spawn_responder(
            &connection,
            "svc/stream",
            vec![
                json!({"text": "a"}),
                json!({"text": "b"}),
                json!({"text": "c", "done": true}),
            ],
        )
        .await;
        let service = service_on(&connection).await;

        let response = service
            .do_request_response(
                Request::new("svc/stream", json!({})),
                RequestOptions {
                    stream: true,
                    completion_expression: Some("input.payload:done".to_string()),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();

        let Response::Stream(mut stream) = response else {
            panic!("expected a stream");
        };

        let mut seen = Vec::new();
        while let Some((message, last)) = stream.next().await.unwrap() {
            seen.push((message.payload["text"].clone(), last));
            if last {
                break;
            }
        }
        assert_eq!(
            seen,
            vec![
                (json!("a"), false),
                (json!("b"), false),
                (json!("c"), true),
            ]
        );
        assert!(stream.next().await.unwrap().is_none());
        service.stop().await;
    }

    #[tokio::test]
    async fn late_reply_after_timeout_is_discarded() {
        let connection = dev_connection();

        // A responder that answers well after the caller has given up.
        let responder = DevSession::connect(&connection);
        let requests = responder
            .subscribe(&TopicFilter::parse("svc/slow").unwrap())
            .await
            .unwrap();
        let responder_session = responder.clone();
        tokio::spawn(async move {
            while let Ok(received) = requests.recv_async().await {
                tokio::time::sleep(Duration::from_millis(300)).await;
                let reply_topic = received
                    .user_properties
                    .get(REPLY_TOPIC_PROPERTY)
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let cid = received
                    .user_properties
                    .get(CORRELATION_ID_PROPERTY)
                    .cloned();
                if let (Some(reply_topic), Some(cid)) = (reply_topic, cid) {
                    let mut props = Map::new();
                    props.insert(CORRELATION_ID_PROPERTY.into(), cid);
                    let _ = responder_session
                        .publish(&reply_topic, b"{\"late\":true}", &props)
                        .await;
                }
            }
        });

        let service = service_on(&connection).await;
        let result = service
            .do_request_response(
                Request::new("svc/slow", json!({})),
                RequestOptions {
                    timeout_ms: Some(50),
                    ..Default::default()
                },
                None,
            )
            .await;
        assert!(matches!(result, Err(ProcessingError::Timeout(50))));

        // The late reply lands on the reply queue and is silently
        // discarded; nothing panics and nothing is left outstanding.
        tokio::time::sleep(Duration::from_millis(400)).await;
        service.stop().await;
    }

    #[tokio::test]
    async fn requests_route_through_named_sessions() {
        let connection = dev_connection();
        spawn_responder(&connection, "svc/session-echo", vec![json!({"ok": 1})]).await;
        let service = service_on(&connection).await;

        let session_id = service.create_session(None).await.unwrap();
        let response = service
            .do_request_response(
                Request::new("svc/session-echo", json!({})),
                RequestOptions::default(),
                Some(&session_id),
            )
            .await
            .unwrap();
        match response {
            Response::Single(message) => assert_eq!(message.payload, json!({"ok": 1})),
            _ => panic!("expected a single response"),
        }

        let listed = service.list_sessions().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].session_id, session_id);
        service.stop().await;
    }

    #[tokio::test]
    async fn fire_and_forget_registers_no_waiter() {
        let connection = dev_connection();
        let service = service_on(&connection).await;

        let response = service
            .do_request_response(
                Request::new("svc/void", json!({})),
                RequestOptions {
                    wait: false,
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
        assert!(matches!(response, Response::None));
        service.stop().await;
    }

    #[tokio::test]
    async fn session_limit_is_enforced() {
        let connection = dev_connection();
        let service = RequestReplyService::start(
            connection.clone(),
            RequestReplySettings {
                max_sessions: 1,
                ..Default::default()
            },
            PayloadEncoding::Utf8,
            PayloadFormat::Json,
        )
        .await
        .unwrap();

        let first = service.create_session(None).await.unwrap();
        let second = service.create_session(None).await;
        assert!(matches!(
            second,
            Err(ProcessingError::SessionLimitExceeded(1))
        ));

        assert!(service.destroy_session(&first).await.unwrap());
        assert!(!service.destroy_session(&first).await.unwrap());
        service.stop().await;
    }

    #[tokio::test]
    async fn unknown_session_is_reported() {
        let connection = dev_connection();
        let service = service_on(&connection).await;
        let result = service
            .do_request_response(
                Request::new("svc/x", json!({})),
                RequestOptions::default(),
                Some("missing"),
            )
            .await;
        assert!(matches!(result, Err(ProcessingError::SessionNotFound(_))));
        service.stop().await;
    }
}
