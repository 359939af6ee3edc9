//! Prompt sanitation and fallback-variant synthesis.
//!
//! Structured-generation endpoints behind strict proxies reject prompts that
//! read as instructions rather than picture descriptions: markup tags,
//! persona preambles, formatting rules, prohibition vocabulary. The variants
//! built here progressively strip that noise so a content-policy rejection
//! can be dodged without changing what the image should show.

use std::sync::LazyLock;

use regex::Regex;

/// Ceiling for the sanitized full-prompt variant.
pub const SANITIZED_PROMPT_MAX_CHARS: usize = 2000;
/// Ceiling for the synthesized short descriptive variant.
pub const FALLBACK_PROMPT_MAX_CHARS: usize = 800;

// Markup-like tags are stripped but their inner text is preserved.
static TAG_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"</?[^>]+>").unwrap());

static PAGE_DESCRIPTION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<page_description>\s*(.*?)\s*</page_description>").unwrap()
});

static SPACE_RUN_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t]+").unwrap());

static BLANK_RUN_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

/// Tokens that mark a line as an instruction rather than a description.
/// The CJK set mirrors the imperative vocabulary the upstream filters choke
/// on; the English set covers the same ground.
const INSTRUCTION_TOKENS: &[&str] = &[
    "禁止", "不要", "必须", "不得", "请勿", "务必", "严禁", "严格",
    "do not", "don't", "must not", "must ", "never ", "forbidden", "prohibited", "strictly",
];

const META_SECTION_TOKENS: &[&str] = &[
    "reference_information",
    "design_guidelines",
    "reference_images_rules",
];

/// Strip a prompt down to its pictorial content.
///
/// Removes markup tags (keeping inner text), persona/meta lines, lines with
/// prohibition/obligation vocabulary, leading bullets; collapses whitespace
/// and truncates to `max_chars` characters.
pub fn sanitize_prompt(prompt: &str, max_chars: usize) -> String {
    if prompt.trim().is_empty() {
        return String::new();
    }

    let untagged = TAG_REGEX.replace_all(prompt, "\n");

    let mut lines: Vec<String> = Vec::new();
    for raw_line in untagged.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        let lower = line.to_lowercase();
        if lower.starts_with("you are ") || line.starts_with("你是") {
            continue;
        }
        if lower.contains("markdown") {
            continue;
        }
        if META_SECTION_TOKENS.iter().any(|t| lower.contains(t)) {
            continue;
        }
        if INSTRUCTION_TOKENS
            .iter()
            .any(|t| if t.is_ascii() { lower.contains(t) } else { line.contains(t) })
        {
            continue;
        }

        let line = line.trim_start_matches(['-', '•', '*', ' ']).trim();
        if line.is_empty() {
            continue;
        }
        lines.push(line.to_string());
    }

    let cleaned = lines.join("\n");
    let cleaned = SPACE_RUN_REGEX.replace_all(&cleaned, " ");
    let cleaned = BLANK_RUN_REGEX.replace_all(&cleaned, "\n\n");
    truncate_chars(cleaned.trim(), max_chars)
}

/// Synthesize the short descriptive fallback for strict-vocabulary providers.
///
/// Derives poster copy from the `<page_description>` section of the original
/// prompt when present; otherwise returns the bare templated description.
pub fn descriptive_fallback_prompt(prompt: &str, aspect_ratio: &str) -> String {
    let page_desc = PAGE_DESCRIPTION_REGEX
        .captures(prompt)
        .and_then(|c| c.get(1))
        .map(|m| sanitize_prompt(m.as_str(), FALLBACK_PROMPT_MAX_CHARS))
        .unwrap_or_default();

    let base = format!(
        "A clean e-commerce product poster, aspect ratio {aspect_ratio}, realistic commercial \
         photography, tidy background, natural lighting, high resolution."
    );
    if page_desc.is_empty() {
        base
    } else {
        format!("{base}\nPoster copy:\n{page_desc}")
    }
}

/// Ordered prompt variants for the structured-generation protocol,
/// most-specific first. Variants that sanitize to empty text are skipped;
/// duplicates are collapsed.
pub fn prompt_variants(prompt: &str, aspect_ratio: &str, strict_vocabulary: bool) -> Vec<String> {
    let mut variants: Vec<String> = Vec::new();

    if strict_vocabulary {
        let fallback = descriptive_fallback_prompt(prompt, aspect_ratio);
        if !fallback.is_empty() {
            variants.push(fallback);
        }
    } else {
        let original = prompt.trim();
        if !original.is_empty() {
            variants.push(original.to_string());
        }
    }

    let sanitized = sanitize_prompt(prompt, SANITIZED_PROMPT_MAX_CHARS);
    if !sanitized.is_empty() && !variants.contains(&sanitized) {
        variants.push(sanitized);
    }

    if variants.is_empty() {
        let original = prompt.trim();
        if !original.is_empty() {
            variants.push(original.to_string());
        }
    }

    variants
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect::<String>().trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_tags_but_keeps_inner_text() {
        let out = sanitize_prompt("<scene>red sneakers on a beach</scene>", 2000);
        assert_eq!(out, "red sneakers on a beach");
    }

    #[test]
    fn drops_persona_and_meta_lines() {
        let prompt = "You are a senior designer\n你是资深设计师\nUse markdown headings\nred sneakers on sand";
        let out = sanitize_prompt(prompt, 2000);
        assert_eq!(out, "red sneakers on sand");
    }

    #[test]
    fn drops_prohibition_vocabulary_lines() {
        let prompt = "禁止出现文字水印\nDo not add any watermark\nwarm studio light\n严格遵守比例";
        let out = sanitize_prompt(prompt, 2000);
        assert_eq!(out, "warm studio light");
    }

    #[test]
    fn strips_leading_bullets() {
        let out = sanitize_prompt("- red sneakers\n• white background", 2000);
        assert_eq!(out, "red sneakers\nwhite background");
    }

    #[test]
    fn truncates_on_char_boundaries() {
        let long = "图".repeat(900);
        let out = sanitize_prompt(&long, 800);
        assert_eq!(out.chars().count(), 800);
    }

    #[test]
    fn empty_input_sanitizes_to_empty() {
        assert_eq!(sanitize_prompt("", 2000), "");
        assert_eq!(sanitize_prompt("   \n\n  ", 2000), "");
    }

    #[test]
    fn fallback_extracts_page_description_section() {
        let prompt =
            "<rules>markdown only</rules>\n<page_description>Red canvas sneakers, studio shot\
             </page_description>";
        let out = descriptive_fallback_prompt(prompt, "3:4");
        assert!(out.contains("aspect ratio 3:4"));
        assert!(out.contains("Red canvas sneakers, studio shot"));
    }

    #[test]
    fn fallback_without_section_is_generic_but_nonempty() {
        let out = descriptive_fallback_prompt("just words", "1:1");
        assert!(out.contains("aspect ratio 1:1"));
        assert!(!out.contains("Poster copy"));
    }

    #[test]
    fn strict_variants_lead_with_descriptive_fallback() {
        let prompt = "<page_description>Blue enamel mug</page_description>\nDo not use text";
        let variants = prompt_variants(prompt, "1:1", true);
        assert!(variants.len() >= 2);
        assert!(variants[0].contains("Blue enamel mug"));
        assert!(variants[0].starts_with("A clean e-commerce product poster"));
    }

    #[test]
    fn lenient_variants_lead_with_original_prompt() {
        let prompt = "red sneakers on sand";
        let variants = prompt_variants(prompt, "16:9", false);
        assert_eq!(variants[0], "red sneakers on sand");
        // Sanitized form is identical here, so it is deduplicated.
        assert_eq!(variants.len(), 1);
    }

    #[test]
    fn variants_never_empty_for_nonempty_prompt() {
        // Every line is dropped by the sanitizer, so the raw prompt survives
        // as the only variant.
        let prompt = "禁止文字";
        let variants = prompt_variants(prompt, "1:1", false);
        assert_eq!(variants, vec!["禁止文字".to_string()]);
    }
}
