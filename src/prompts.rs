//! Prompts and sampling defaults for batch page conversion.
//!
//! Every request line in a batch carries the same system and user prompt, so
//! they live here as constants. Callers can override either through
//! [`crate::config::BatchConfigBuilder::system_prompt`] and
//! [`crate::config::BatchConfigBuilder::user_prompt`].

/// Default system message for every batch request.
pub const BATCH_SYSTEM_PROMPT: &str = "You are an expert document conversion assistant. Convert this document page to clean, professional Markdown format. Focus on accurate text extraction and proper structure while maintaining readability.";

/// Default text part of the user message; the page image follows it.
pub const BATCH_USER_PROMPT: &str = r#"Convert this document page to Markdown format with these specific requirements:

1. **Text Extraction**: Extract ALL text accurately, including headers, body text, captions, and technical specifications
2. **Structure**: Use proper Markdown heading hierarchy (# ## ### etc.) based on document structure
3. **Tables**: Convert tables to proper Markdown table format with | separators
4. **Technical Content**: Preserve technical symbols, formulas, part numbers, and specifications exactly
5. **Code/Commands**: Use proper code blocks for any code examples or commands
6. **Lists**: Convert bulleted and numbered lists to proper Markdown list format
7. **No Image References**: DO NOT include any ![](filename.png) image references
8. **Describe Visuals**: Describe diagrams, schematics, and images in plain text
9. **Clean Output**: Output ONLY the Markdown content, no code block wrappers, no "```markdown"

Focus on creating clean, professional documentation that preserves all information from the original page."#;

/// Near-deterministic sampling: transcription, not creative writing.
pub const BATCH_TEMPERATURE: f32 = 0.05;

/// Output cap per page. Dense technical pages run past 4 000 tokens.
pub const BATCH_MAX_TOKENS: u32 = 8192;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_prompt_forbids_fences_and_image_refs() {
        assert!(BATCH_USER_PROMPT.contains("no \"```markdown\""));
        assert!(BATCH_USER_PROMPT.contains("DO NOT include any ![](filename.png)"));
    }
}
