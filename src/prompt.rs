//! Context assembly and prompt construction.
//!
//! Retrieved chunks are concatenated, most similar first, into a context
//! block bounded by `retrieval.max_context_length` characters. Each excerpt
//! is tagged with the file it came from:
//!
//! ```text
//! [Source: install-guide.pdf]
//! <chunk text>
//!
//! ```
//!
//! Assembly stops at the first chunk that would overflow the budget; no
//! chunk is ever cut short. The context, an optional system-information
//! block and the persona form the system message; the question is the
//! user message.

use std::path::Path;

use crate::llm::ChatMessage;
use crate::models::ScoredChunk;

/// Persona used when `[prompt] persona` is not set.
pub const DEFAULT_PERSONA: &str = "\
你是银河麒麟操作系统的智能问答助手，专门帮助用户解决麒麟系统相关的问题。

你的能力包括：
1. 回答银河麒麟系统的使用问题
2. 提供系统配置和故障排除建议
3. 解释麒麟SDK2.5的接口和功能
4. 协助进行系统管理和维护

回答要求：
- 使用中文回答；如果用户使用其他语言提问，则使用该语言回答
- 提供准确、实用的信息
- 如果不确定，请明确说明
- 优先使用提供的上下文信息";

const CONTEXT_HEADING: &str = "相关文档内容：";
const SYSTEM_INFO_HEADING: &str = "当前系统信息：";

/// File name shown for a chunk's source path.
pub fn source_label(source_path: &str) -> &str {
    Path::new(source_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(source_path)
}

/// Concatenate chunk excerpts, in the given order, within `max_len` characters.
pub fn assemble_context(chunks: &[ScoredChunk], max_len: usize) -> String {
    let mut context = String::new();
    let mut used = 0usize;

    for scored in chunks {
        let entry = format!(
            "[Source: {}]\n{}\n\n",
            source_label(&scored.chunk.source_path),
            scored.chunk.text
        );
        let len = entry.chars().count();
        if used + len > max_len {
            break;
        }
        context.push_str(&entry);
        used += len;
    }

    context
}

/// Build the system + user message pair for one question.
///
/// An empty `context` leaves the excerpt section out entirely, so the
/// question is answered as a general one.
pub fn build_messages(
    persona: &str,
    context: &str,
    system_info: Option<&str>,
    question: &str,
) -> Vec<ChatMessage> {
    let mut system = persona.trim().to_string();

    let context = context.trim_end();
    if !context.is_empty() {
        system.push_str("\n\n");
        system.push_str(CONTEXT_HEADING);
        system.push('\n');
        system.push_str(context);
    }

    if let Some(info) = system_info.map(str::trim).filter(|s| !s.is_empty()) {
        system.push_str("\n\n");
        system.push_str(SYSTEM_INFO_HEADING);
        system.push('\n');
        system.push_str(info);
    }

    vec![ChatMessage::system(system), ChatMessage::user(question)]
}
