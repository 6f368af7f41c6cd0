//! Scripted model double shared by the unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::anthropic::{
    AnthropicError, ContentBlock, MessageSender, MessagesRequest, MessagesResponse, Usage,
};

/// One canned reply.
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    RateLimited,
    Status(u16, String),
}

impl Reply {
    pub fn text(s: impl Into<String>) -> Self {
        Reply::Text(s.into())
    }

    fn into_result(self) -> Result<MessagesResponse, AnthropicError> {
        match self {
            Reply::Text(text) => Ok(MessagesResponse {
                id: "mock".into(),
                content: vec![ContentBlock {
                    content_type: "text".into(),
                    text,
                }],
                model: "mock".into(),
                stop_reason: Some("end_turn".into()),
                usage: Usage::default(),
            }),
            Reply::RateLimited => Err(AnthropicError::RateLimited { retry_after_ms: 1 }),
            Reply::Status(status, message) => Err(AnthropicError::ApiError { status, message }),
        }
    }
}

struct Route {
    marker: String,
    replies: VecDeque<Reply>,
}

/// Replies are chosen by the first route whose marker appears in the system
/// prompt or user message. A route's last reply repeats once the rest are used.
pub struct ScriptedSender {
    routes: Mutex<Vec<Route>>,
    fallback: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<MessagesRequest>>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedSender {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(Vec::new()),
            fallback: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Replies for requests not matched by any route, in order.
    pub fn with_replies(replies: impl IntoIterator<Item = Reply>) -> Self {
        let sender = Self::new();
        sender
            .fallback
            .lock()
            .unwrap()
            .extend(replies);
        sender
    }

    pub fn route(self, marker: &str, replies: impl IntoIterator<Item = Reply>) -> Self {
        self.routes.lock().unwrap().push(Route {
            marker: marker.to_string(),
            replies: replies.into_iter().collect(),
        });
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn requests(&self) -> Vec<MessagesRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// User messages of recorded requests whose prompt contains `marker`.
    pub fn prompts_matching(&self, marker: &str) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter(|r| haystack(r).contains(marker))
            .map(|r| r.messages[0].content.clone())
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self, req: &MessagesRequest) -> Reply {
        let text = haystack(req);
        {
            let mut routes = self.routes.lock().unwrap();
            if let Some(route) = routes.iter_mut().find(|r| text.contains(&r.marker)) {
                return pop_or_repeat(&mut route.replies);
            }
        }
        pop_or_repeat(&mut self.fallback.lock().unwrap())
    }
}

fn haystack(req: &MessagesRequest) -> String {
    let mut text = req.system.clone().unwrap_or_default();
    for message in &req.messages {
        text.push('\n');
        text.push_str(&message.content);
    }
    text
}

fn pop_or_repeat(replies: &mut VecDeque<Reply>) -> Reply {
    match replies.len() {
        0 => Reply::Status(400, "script exhausted".into()),
        1 => replies[0].clone(),
        _ => replies.pop_front().unwrap_or(Reply::Status(400, "script exhausted".into())),
    }
}

impl MessageSender for ScriptedSender {
    async fn send_message(
        &self,
        req: &MessagesRequest,
    ) -> Result<MessagesResponse, AnthropicError> {
        self.requests.lock().unwrap().push(req.clone());
        let reply = self.next_reply(req);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        reply.into_result()
    }
}
