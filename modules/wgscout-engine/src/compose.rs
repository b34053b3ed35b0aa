//! Message composition.
//!
//! With an LLM configured: one classification call (language + keyword
//! the lister asks applicants to echo), one generation call. Without one,
//! or on any LLM failure, a deterministic template fallback that never
//! fails. Given identical inputs and a stubbed model, output is
//! byte-identical.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use ai_client::{extract_json, ChatMessage, ChatModel, ChatRequest};
use wgscout_common::{ComposeError, Listing, OutreachMessage};

/// What the classification call yields about a listing's free text.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub language: String,
    pub keyword: Option<String>,
}

pub struct GenerateRequest<'a> {
    pub template: &'a str,
    pub language: &'a str,
    pub keyword: Option<&'a str>,
    pub do_list: &'a [String],
    pub dont_list: &'a [String],
    pub contact_first_name: &'a str,
}

/// The two LLM call shapes the composer depends on. Stubbed in tests.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Classification, ComposeError>;
    async fn generate(&self, request: GenerateRequest<'_>) -> Result<String, ComposeError>;
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// Language-keyed message templates. Construction requires the default
/// entry, so the fallback path always has a template to use.
#[derive(Debug, Clone)]
pub struct TemplateSet {
    entries: Vec<(String, String)>,
}

impl TemplateSet {
    pub fn new(default_language: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            entries: vec![(default_language.into().to_lowercase(), body.into())],
        }
    }

    pub fn with(mut self, language: impl Into<String>, body: impl Into<String>) -> Self {
        self.entries.push((language.into().to_lowercase(), body.into()));
        self
    }

    pub fn for_language(&self, language: &str) -> Option<&str> {
        let language = language.to_lowercase();
        self.entries
            .iter()
            .find(|(lang, _)| *lang == language)
            .map(|(_, body)| body.as_str())
    }

    pub fn default_language(&self) -> &str {
        &self.entries[0].0
    }

    pub fn default_body(&self) -> &str {
        &self.entries[0].1
    }
}

// ---------------------------------------------------------------------------
// Composer
// ---------------------------------------------------------------------------

/// Placeholder the templates use for the contact's first name. Kept
/// as-is from the template files this replaces, typo included.
const NAME_PLACEHOLDER: &str = "receipient";

pub struct MessageComposer {
    templates: TemplateSet,
    do_list: Vec<String>,
    dont_list: Vec<String>,
    llm: Option<Arc<dyn LanguageModel>>,
}

impl MessageComposer {
    pub fn new(
        templates: TemplateSet,
        do_list: Vec<String>,
        dont_list: Vec<String>,
        llm: Option<Arc<dyn LanguageModel>>,
    ) -> Self {
        Self {
            templates,
            do_list,
            dont_list,
            llm,
        }
    }

    /// Compose an outreach message for one listing. Never fails: any LLM
    /// error degrades to the template fallback.
    pub async fn compose(&self, listing: &Listing) -> OutreachMessage {
        if let Some(llm) = &self.llm {
            match self.compose_with_llm(llm.as_ref(), listing).await {
                Ok(message) => return message,
                Err(e) => {
                    warn!(
                        listing_id = listing.listing_id.as_str(),
                        error = %e,
                        "llm compose failed, using template fallback"
                    );
                }
            }
        }
        self.fallback(listing)
    }

    async fn compose_with_llm(
        &self,
        llm: &dyn LanguageModel,
        listing: &Listing,
    ) -> Result<OutreachMessage, ComposeError> {
        let text = listing.detail_text.as_deref().unwrap_or(&listing.title);
        let classification = llm.classify(text).await?;

        let (language, template) = match self.templates.for_language(&classification.language) {
            Some(template) => (classification.language.to_lowercase(), template),
            // No template in the detected language: write in the default.
            None => (
                self.templates.default_language().to_string(),
                self.templates.default_body(),
            ),
        };

        let body = llm
            .generate(GenerateRequest {
                template,
                language: &language,
                keyword: classification.keyword.as_deref(),
                do_list: &self.do_list,
                dont_list: &self.dont_list,
                contact_first_name: listing.contact_first_name(),
            })
            .await?;

        Ok(OutreachMessage {
            language,
            keyword: classification.keyword,
            body,
        })
    }

    /// Deterministic fallback: default-language template with the name
    /// substituted. No clock, no randomness, no network.
    pub fn fallback(&self, listing: &Listing) -> OutreachMessage {
        OutreachMessage {
            language: self.templates.default_language().to_string(),
            keyword: None,
            body: self
                .templates
                .default_body()
                .replace(NAME_PLACEHOLDER, listing.contact_first_name()),
        }
    }
}

// ---------------------------------------------------------------------------
// OpenAI-backed model
// ---------------------------------------------------------------------------

const LLM_CALL_TIMEOUT: Duration = Duration::from_secs(20);
/// Classification only needs the opening of the ad text.
const CLASSIFY_TEXT_LIMIT: usize = 1200;

pub struct OpenAiLanguageModel {
    chat: Arc<dyn ChatModel>,
    model: String,
    timeout: Duration,
}

impl OpenAiLanguageModel {
    pub fn new(chat: Arc<dyn ChatModel>, model: impl Into<String>) -> Self {
        Self {
            chat,
            model: model.into(),
            timeout: LLM_CALL_TIMEOUT,
        }
    }

    async fn complete(&self, prompt: String) -> Result<String, ComposeError> {
        let request = ChatRequest::new(
            self.model.clone(),
            vec![ChatMessage::user(prompt)],
        )
        .temperature(0.7)
        .max_tokens(1000);

        tokio::time::timeout(self.timeout, self.chat.complete(request))
            .await
            .map_err(|_| ComposeError::LlmTimeout)?
            .map_err(|e| ComposeError::LlmInvalidResponse(e.to_string()))
    }
}

#[derive(Deserialize)]
struct ClassifyPayload {
    language: String,
    #[serde(default)]
    keyword: Option<String>,
}

#[async_trait]
impl LanguageModel for OpenAiLanguageModel {
    async fn classify(&self, text: &str) -> Result<Classification, ComposeError> {
        let snippet = truncate_chars(text, CLASSIFY_TEXT_LIMIT);
        let prompt = format!(
            "What language is this rental listing written in, and does it contain a keyword \
             applicants are asked to include in their message (often wrapped in quotation \
             marks)? Not all listings have such a keyword.\n\
             Listing text:\n'{snippet}'\n\
             Respond only in JSON like {{\"language\": \"<single word>\", \
             \"keyword\": \"<keyword or empty string>\"}}."
        );

        let response = self.complete(prompt).await?;
        let json = extract_json(&response)
            .ok_or_else(|| ComposeError::LlmInvalidResponse(response.clone()))?;
        let payload: ClassifyPayload = serde_json::from_str(json)
            .map_err(|e| ComposeError::LlmInvalidResponse(e.to_string()))?;

        Ok(Classification {
            language: payload.language.to_lowercase(),
            keyword: payload.keyword.filter(|k| !k.trim().is_empty()),
        })
    }

    async fn generate(&self, request: GenerateRequest<'_>) -> Result<String, ComposeError> {
        let mut prompt = format!(
            "Draft a short message applying for a flat-share room, in {language}, \
             addressed to {name}. Base it on this template, keeping its tone and key \
             points:\n---\n{template}\n---\n",
            language = request.language,
            name = request.contact_first_name,
            template = request.template,
        );
        if let Some(keyword) = request.keyword {
            prompt.push_str(&format!(
                "Open the message with the keyword \"{keyword}\" on its own line, \
                 as the listing asks.\n"
            ));
        }
        if !request.do_list.is_empty() {
            prompt.push_str(&format!("Make sure to: {}.\n", request.do_list.join("; ")));
        }
        if !request.dont_list.is_empty() {
            prompt.push_str(&format!("Never: {}.\n", request.dont_list.join("; ")));
        }
        prompt.push_str("Respond with the message text only, no commentary.");

        let body = self.complete(prompt).await?;
        let body = body.trim().to_string();
        if body.is_empty() {
            return Err(ComposeError::LlmInvalidResponse("empty draft".to_string()));
        }
        Ok(body)
    }
}

fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use chrono::Utc;
    use uuid::Uuid;
    use wgscout_common::RawListing;

    fn listing(contact: &str, detail: Option<&str>) -> Listing {
        let raw = RawListing {
            listing_ref: "/ad.html".into(),
            contact_name: contact.into(),
            address: "Mitte, Berlin".into(),
            wg_type: "2er WG".into(),
            district: Some("Mitte".into()),
            price_eur: Some(500),
            size_sqm: Some(18),
            rental_start: None,
            rental_end: None,
            online_since: None,
            detail_text: detail.map(str::to_string),
        };
        Listing::from_raw(&raw, Uuid::new_v4(), "https://example.org")
    }

    fn templates() -> TemplateSet {
        TemplateSet::new("english", "Hi receipient, I would love to visit the room.")
            .with("german", "Hallo receipient, ich würde das Zimmer gerne ansehen.")
    }

    struct StubLlm {
        language: &'static str,
        keyword: Option<&'static str>,
        fail_generate: bool,
    }

    #[async_trait]
    impl LanguageModel for StubLlm {
        async fn classify(&self, _text: &str) -> Result<Classification, ComposeError> {
            Ok(Classification {
                language: self.language.to_string(),
                keyword: self.keyword.map(str::to_string),
            })
        }

        async fn generate(&self, request: GenerateRequest<'_>) -> Result<String, ComposeError> {
            if self.fail_generate {
                return Err(ComposeError::LlmTimeout);
            }
            Ok(format!(
                "[{}] {} -> {}",
                request.language,
                request.keyword.unwrap_or("-"),
                request.contact_first_name
            ))
        }
    }

    #[tokio::test]
    async fn fallback_is_deterministic_without_llm() {
        let composer = MessageComposer::new(templates(), vec![], vec![], None);
        let listing = listing("Anna Schmidt", None);

        let a = composer.compose(&listing).await;
        let b = composer.compose(&listing).await;

        assert_eq!(a, b);
        assert_eq!(a.language, "english");
        assert_eq!(a.body, "Hi Anna, I would love to visit the room.");
        assert_eq!(a.keyword, None);
    }

    #[tokio::test]
    async fn llm_path_uses_detected_language_and_keyword() {
        let llm: Arc<dyn LanguageModel> = Arc::new(StubLlm {
            language: "German",
            keyword: Some("Banane"),
            fail_generate: false,
        });
        let composer = MessageComposer::new(templates(), vec![], vec![], Some(llm));
        let listing = listing("Jonas Weber", Some("Schreib 'Banane' in deine Nachricht."));

        let message = composer.compose(&listing).await;
        assert_eq!(message.language, "german");
        assert_eq!(message.keyword.as_deref(), Some("Banane"));
        assert_eq!(message.body, "[german] Banane -> Jonas");
    }

    #[tokio::test]
    async fn unknown_language_falls_back_to_default_template() {
        let llm: Arc<dyn LanguageModel> = Arc::new(StubLlm {
            language: "French",
            keyword: None,
            fail_generate: false,
        });
        let composer = MessageComposer::new(templates(), vec![], vec![], Some(llm));

        let message = composer.compose(&listing("Marie", None)).await;
        assert_eq!(message.language, "english");
    }

    #[tokio::test]
    async fn llm_failure_degrades_to_fallback() {
        let llm: Arc<dyn LanguageModel> = Arc::new(StubLlm {
            language: "german",
            keyword: None,
            fail_generate: true,
        });
        let composer = MessageComposer::new(templates(), vec![], vec![], Some(llm));
        let listing = listing("Anna Schmidt", None);

        let message = composer.compose(&listing).await;
        assert_eq!(message.body, "Hi Anna, I would love to visit the room.");
        assert_eq!(message.language, "english");
    }

    struct CannedChat {
        response: Result<&'static str, ()>,
    }

    #[async_trait]
    impl ChatModel for CannedChat {
        async fn complete(&self, _request: ChatRequest) -> anyhow::Result<String> {
            self.response
                .map(str::to_string)
                .map_err(|_| anyhow!("boom"))
        }
    }

    #[tokio::test]
    async fn classify_parses_fenced_json() {
        let chat: Arc<dyn ChatModel> = Arc::new(CannedChat {
            response: Ok("```json\n{\"language\": \"German\", \"keyword\": \"Banane\"}\n```"),
        });
        let model = OpenAiLanguageModel::new(chat, "test-model");

        let c = model.classify("irgendein Text").await.unwrap();
        assert_eq!(c.language, "german");
        assert_eq!(c.keyword.as_deref(), Some("Banane"));
    }

    #[tokio::test]
    async fn classify_empty_keyword_is_none() {
        let chat: Arc<dyn ChatModel> = Arc::new(CannedChat {
            response: Ok(r#"{"language": "English", "keyword": ""}"#),
        });
        let model = OpenAiLanguageModel::new(chat, "test-model");

        let c = model.classify("some text").await.unwrap();
        assert_eq!(c.keyword, None);
    }

    #[tokio::test]
    async fn classify_prose_response_is_invalid() {
        let chat: Arc<dyn ChatModel> = Arc::new(CannedChat {
            response: Ok("It looks German to me!"),
        });
        let model = OpenAiLanguageModel::new(chat, "test-model");

        assert!(matches!(
            model.classify("text").await,
            Err(ComposeError::LlmInvalidResponse(_))
        ));
    }
}
