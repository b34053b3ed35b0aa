/// Recover a JSON object from a model response that may be wrapped in
/// markdown code fences or surrounded by prose. Returns the substring
/// between the first `{` and the last `}`, with fences stripped.
pub fn extract_json(response: &str) -> Option<&str> {
    let trimmed = response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&trimmed[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_json_passes_through() {
        assert_eq!(extract_json(r#"{"language": "German"}"#), Some(r#"{"language": "German"}"#));
    }

    #[test]
    fn fenced_json_is_unwrapped() {
        assert_eq!(extract_json("```json\n{\"a\": 1}\n```"), Some("{\"a\": 1}"));
    }

    #[test]
    fn json_embedded_in_prose_is_found() {
        assert_eq!(
            extract_json("Sure! Here you go: {\"keyword\": \"banana\"} hope that helps"),
            Some("{\"keyword\": \"banana\"}")
        );
    }

    #[test]
    fn no_json_yields_none() {
        assert_eq!(extract_json("I could not find a keyword."), None);
    }
}
