//! OpenAI chat-completion wire format.
//!
//! Request and response bodies for `/chat/completions` and `/models`, the
//! server-sent-event framing used for streamed replies, and the formatting
//! of title-generation replies.

use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::llm::LocalModel;

/// Terminal marker closing every completed stream.
pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// Content returned when a non-streaming generation exceeds its time limit.
pub const TIMEOUT_MESSAGE: &str = "The request took too long and was stopped.";

/// Substring marking a client-side task prompt such as title generation.
pub const TASK_MARKER: &str = "### Task:";

/// Field extracted from task replies.
pub const TITLE_FIELD: &str = "title";

static THINK_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<think>.*?</think>").expect("valid think regex"));
static CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```[a-zA-Z]*").expect("valid fence regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// Body of `POST /chat/completions`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub stream: Option<bool>,
}

impl ChatRequest {
    /// Prompt for this turn: the content of the last message.
    pub fn prompt(&self) -> Option<&str> {
        self.messages.last().map(|m| m.content.as_str())
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

/// Returns true when `prompt` is a task prompt that gets a JSON reply.
pub fn is_task_prompt(prompt: &str) -> bool {
    prompt.contains(TASK_MARKER)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub delta: Delta,
    pub index: u32,
    pub finish_reason: Option<String>,
}

/// One incremental `chat.completion.chunk` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub choices: Vec<ChunkChoice>,
}

impl ChatCompletionChunk {
    /// Chunk carrying `token` with a fresh id.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            object: "chat.completion.chunk".into(),
            choices: vec![ChunkChoice {
                delta: Delta {
                    content: token.into(),
                },
                index: 0,
                finish_reason: None,
            }],
        }
    }

    /// Encodes the chunk as one SSE `data:` frame.
    pub fn to_frame(&self) -> Result<Bytes, serde_json::Error> {
        let json = serde_json::to_string(self)?;
        Ok(Bytes::from(format!("data: {json}\n\n")))
    }
}

/// Chunk frame for `token`.
pub fn chunk_frame(token: &str) -> Result<Bytes, serde_json::Error> {
    ChatCompletionChunk::new(token).to_frame()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub message: Message,
    pub finish_reason: String,
    pub index: u32,
}

/// Complete `chat.completion` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
}

impl ChatCompletion {
    /// Assistant reply with `content`, finished with `"stop"`.
    pub fn new(model: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            object: "chat.completion".into(),
            model: model.into(),
            choices: vec![CompletionChoice {
                message: Message {
                    role: Role::Assistant,
                    content: content.into(),
                },
                finish_reason: "stop".into(),
                index: 0,
            }],
        }
    }

    /// Content of the first choice.
    pub fn content(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_str())
    }
}

/// Removes `<think>...</think>` reasoning blocks and surrounding whitespace.
pub fn strip_reasoning(text: &str) -> String {
    THINK_BLOCK.replace_all(text, "").trim().to_string()
}

/// Reads `key` from a JSON object that may be wrapped in a markdown code
/// fence. Returns `None` if the text is not a JSON object or lacks the key.
pub fn extract_json_field(text: &str, key: &str) -> Option<Value> {
    let cleaned = CODE_FENCE.replace_all(text, "");
    let parsed: Value = serde_json::from_str(cleaned.trim()).ok()?;
    parsed.get(key).cloned()
}

/// Formats a raw task reply as a completion whose content is
/// `{"title": <value or null>}`.
pub fn title_completion(raw: &str, model: &str) -> ChatCompletion {
    let title = extract_json_field(&strip_reasoning(raw), TITLE_FIELD).unwrap_or(Value::Null);
    let mut content = serde_json::Map::new();
    content.insert(TITLE_FIELD.to_string(), title);
    ChatCompletion::new(model, Value::Object(content).to_string())
}

/// Model entry in the `/models` listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelCard {
    pub id: String,
    pub object: &'static str,
    pub size: Option<u64>,
    pub modified: Option<String>,
    pub owned_by: &'static str,
}

impl From<LocalModel> for ModelCard {
    fn from(model: LocalModel) -> Self {
        Self {
            id: model.name,
            object: "model",
            size: model.size,
            modified: model.modified_at,
            owned_by: "user",
        }
    }
}

/// Body of `GET /models`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelCard>,
}

impl From<Vec<LocalModel>> for ModelList {
    fn from(models: Vec<LocalModel>) -> Self {
        Self {
            object: "list",
            data: models.into_iter().map(ModelCard::from).collect(),
        }
    }
}
