use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Roles accepted on inbound messages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::System, Role::User, Role::Assistant, Role::Tool];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        Role::ALL.into_iter().find(|r| r.as_str() == s)
    }
}

/// Message content: a plain string or an array of typed parts
/// (`{"type":"text","text":...}`, `{"type":"image_url",...}`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<Value>),
}

impl MessageContent {
    /// Concatenate the textual parts; non-text parts contribute nothing.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| {
                    let ty = p.get("type").and_then(|t| t.as_str()).unwrap_or("text");
                    if ty == "text" || ty == "input_text" {
                        p.get("text").and_then(|t| t.as_str())
                    } else {
                        None
                    }
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Vendor-specific message fields, forwarded untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Inbound Chat Completions request.
///
/// Known fields are typed; everything else (temperature, top_p, vendor
/// extensions such as `chat_template_kwargs`) lands in `extra` and is
/// serialized back verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    /// Legacy function declarations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub functions: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatCompletionRequest {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// True when the request declares tools or legacy functions.
    pub fn declares_tools(&self) -> bool {
        self.tools.as_ref().is_some_and(|t| !t.is_empty())
            || self.functions.as_ref().is_some_and(|f| !f.is_empty())
    }

    /// Text fed to the token counter: message contents joined by newlines.
    pub fn prompt_text(&self) -> String {
        self.messages
            .iter()
            .filter_map(|m| m.content.as_ref().map(MessageContent::text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Token accounting attached to buffered responses.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Parse an upstream `usage` object, tolerating a missing `total_tokens`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let prompt = value.get("prompt_tokens")?.as_u64()?;
        let completion = value
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let total = value
            .get("total_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(prompt + completion);
        Some(Self {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: total,
        })
    }
}

/// What the first choice of a completion carries: free text or tool calls.
#[derive(Debug, Clone, PartialEq)]
pub enum ChoiceBody {
    Content(String),
    ToolCalls(Vec<Value>),
}

impl ChoiceBody {
    /// Classify a `choices[i].message` object.
    pub fn from_message(message: &Value) -> Self {
        if let Some(calls) = message.get("tool_calls").and_then(|v| v.as_array()) {
            if !calls.is_empty() {
                return ChoiceBody::ToolCalls(calls.clone());
            }
        }
        // legacy single function_call
        if let Some(call) = message.get("function_call").filter(|v| v.is_object()) {
            return ChoiceBody::ToolCalls(vec![call.clone()]);
        }
        let text = match message.get("content") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(parts)) => MessageContent::Parts(parts.clone()).text(),
            _ => String::new(),
        };
        ChoiceBody::Content(text)
    }

    pub fn is_function_call(&self) -> bool {
        matches!(self, ChoiceBody::ToolCalls(_))
    }
}
