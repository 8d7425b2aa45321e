//! Prompt styles understood by every provider.

/// `(style, prompt)` pairs.
const PROMPTS: &[(&str, &str)] = &[
    (
        "concise",
        "Describe this image in one short sentence.",
    ),
    (
        "detailed",
        "Describe this image in detail: the main subjects, their actions, the setting, \
         lighting and any visible text.",
    ),
    (
        "alt-text",
        "Write accessible alt text for this image in at most 125 characters.",
    ),
    (
        "keywords",
        "List 5 to 15 comma-separated keywords that describe this image. Output only the keywords.",
    ),
];

/// Prompt text for `style`, or `None` if the style is unknown.
pub fn prompt_for(style: &str) -> Option<&'static str> {
    PROMPTS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(style))
        .map(|(_, prompt)| *prompt)
}

pub fn styles() -> impl Iterator<Item = &'static str> {
    PROMPTS.iter().map(|(name, _)| *name)
}

pub fn is_known(style: &str) -> bool {
    prompt_for(style).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        assert!(prompt_for("Detailed").is_some());
        assert!(prompt_for("haiku").is_none());
        assert_eq!(styles().count(), 4);
    }
}
