//! The answering pipeline.
//!
//! [`AnswerService::answer`] walks a question through
//! `Validated → OCR (optional) → ContextBuilt → Answering → Responded`.
//! Any stage may end in a failure; only [`AnswerError`]s reach the caller,
//! all other problems (bad image, OCR engine down, missing content, LLM not
//! configured, unparseable model output) degrade the answer instead.
//!
//! The whole call is bounded by an explicit `deadline`. Waiting for an LLM
//! slot, the OCR run and the LLM call all count against it.

use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::{timeout_at, Instant};

use crate::config::{Config, ContextConfig};
use crate::context::{build_context, AssembledContext};
use crate::error::{AnswerError, LlmError};
use crate::llm::{Completer, CompletionRequest};
use crate::models::{excerpt, Answer, Link, Question};
use crate::ocr::{extract_from_base64, TextExtractor};
use crate::store::ContentStore;

/// Instructions sent as the system message of every completion.
pub const SYSTEM_PROMPT: &str = "You are a virtual teaching assistant for the Tools in Data Science course. \
Answer the student's question using only the provided context (course content, forum posts and any image text).\n\
Rules:\n\
1. Use only information from the context.\n\
2. Be helpful, educational and concise.\n\
3. Cite the URLs from the context that support your answer.\n\
4. For coding questions, prefer the exact models and versions mentioned in the context.\n\
5. If the context does not cover the question, say that no relevant information was found.\n\
Respond with a JSON object: {\"answer\": string, \"links\": [{\"url\": string, \"text\": string}]}";

/// Maximum characters of the question written to logs.
const LOG_QUESTION_CHARS: usize = 100;

#[derive(Debug, Deserialize)]
struct ModelOutput {
    answer: String,
    #[serde(default)]
    links: Vec<ModelLink>,
}

#[derive(Debug, Deserialize)]
struct ModelLink {
    #[serde(default)]
    url: String,
    #[serde(default)]
    text: String,
}

/// Answers questions against a read-only content store.
///
/// Cheap to share: wrap it in an `Arc` and hand it to every request.
pub struct AnswerService {
    store: Arc<ContentStore>,
    completer: Arc<dyn Completer>,
    extractor: Arc<dyn TextExtractor>,
    limiter: Semaphore,
    context: ContextConfig,
    ocr_max_chars: usize,
}

impl AnswerService {
    pub fn new(
        store: Arc<ContentStore>,
        completer: Arc<dyn Completer>,
        extractor: Arc<dyn TextExtractor>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            completer,
            extractor,
            limiter: Semaphore::new(config.llm.max_in_flight),
            context: config.context.clone(),
            ocr_max_chars: config.ocr.max_chars,
        }
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn completer(&self) -> &dyn Completer {
        self.completer.as_ref()
    }

    pub fn extractor(&self) -> &dyn TextExtractor {
        self.extractor.as_ref()
    }

    /// Answer `question`, failing with [`AnswerError::Timeout`] if no answer
    /// is ready by `deadline`.
    pub async fn answer(&self, question: &Question, deadline: Instant) -> Result<Answer, AnswerError> {
        let text = question.text.trim();
        if text.is_empty() {
            return Err(AnswerError::InvalidInput(
                "question must not be empty".to_string(),
            ));
        }
        tracing::info!(
            question = %excerpt(text, LOG_QUESTION_CHARS),
            has_image = question.image.is_some(),
            "processing question"
        );

        let ocr_text = match question.image.as_deref() {
            Some(image) => self.run_ocr(image, deadline).await,
            None => None,
        };

        let assembled = self.assemble(text, ocr_text.as_deref());
        tracing::debug!(
            prompt_chars = assembled.prompt.chars().count(),
            candidates = assembled.links.len(),
            "context built"
        );

        // Queue for an LLM slot; the wait counts against the deadline
        let _permit = timeout_at(deadline, self.limiter.acquire())
            .await
            .map_err(|_| AnswerError::Timeout)?
            .map_err(|e| AnswerError::Upstream(e.to_string()))?;

        let request = CompletionRequest {
            system: SYSTEM_PROMPT.to_string(),
            user: assembled.prompt.clone(),
        };

        tracing::debug!(model = self.completer.model_name(), "answering");
        let raw = match timeout_at(deadline, self.completer.complete(&request, deadline)).await {
            Err(_) | Ok(Err(LlmError::Timeout)) => {
                tracing::warn!("LLM call exceeded the response deadline");
                return Err(AnswerError::Timeout);
            }
            Ok(Err(LlmError::Disabled(reason))) => {
                tracing::warn!(%reason, "returning degraded answer");
                return Ok(self.degraded_answer(&reason, &assembled.links));
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "LLM call failed");
                return Err(AnswerError::Upstream(e.to_string()));
            }
            Ok(Ok(raw)) => raw,
        };

        match parse_model_output(&raw) {
            Ok(mut answer) => {
                answer.links = self.grounded_links(answer.links, &assembled.links);
                tracing::info!(links = answer.links.len(), "question answered");
                Ok(answer)
            }
            Err(e) if !raw.trim().is_empty() => {
                // Best effort: the raw text is still an answer
                tracing::warn!(error = %e, "using raw model output as answer");
                Ok(Answer {
                    answer: raw.trim().to_string(),
                    links: Vec::new(),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Build the prompt for `question` without calling the LLM.
    pub fn assemble(&self, question: &str, ocr_text: Option<&str>) -> AssembledContext {
        build_context(question, ocr_text, &self.store, &self.context)
    }

    async fn run_ocr(&self, image: &str, deadline: Instant) -> Option<String> {
        let extraction = extract_from_base64(self.extractor.as_ref(), image, self.ocr_max_chars);
        match timeout_at(deadline, extraction).await {
            Ok(Ok(text)) if !text.is_empty() => {
                tracing::debug!(chars = text.chars().count(), "OCR text extracted");
                Some(text)
            }
            Ok(Ok(_)) => {
                tracing::debug!("OCR found no text");
                None
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "continuing without image text");
                None
            }
            Err(_) => {
                tracing::warn!("OCR hit the response deadline, continuing without image text");
                None
            }
        }
    }

    /// Keep only the model's links that point at documents in the prompt,
    /// labelled with the candidate's text. Falls back to the top candidates
    /// when none survive.
    fn grounded_links(&self, model_links: Vec<Link>, candidates: &[Link]) -> Vec<Link> {
        let kept: Vec<Link> = model_links
            .iter()
            .filter_map(|link| candidates.iter().find(|c| c.url == link.url))
            .cloned()
            .collect();
        if kept.len() < model_links.len() {
            tracing::debug!(
                dropped = model_links.len() - kept.len(),
                "dropping model links not among retrieved documents"
            );
        }
        if kept.is_empty() {
            return self.candidate_links(candidates);
        }
        kept
    }

    fn candidate_links(&self, links: &[Link]) -> Vec<Link> {
        links.iter().take(self.context.max_links).cloned().collect()
    }

    fn degraded_answer(&self, reason: &str, links: &[Link]) -> Answer {
        let links = self.candidate_links(links);
        let answer = if links.is_empty() {
            format!(
                "The answering model is unavailable ({}) and no matching course material was found.",
                reason
            )
        } else {
            format!(
                "The answering model is unavailable ({}). These course materials look most relevant to your question.",
                reason
            )
        };
        Answer { answer, links }
    }
}

/// Parse model output of the form `{"answer": ..., "links": [...]}`,
/// optionally wrapped in a Markdown code fence.
pub fn parse_model_output(raw: &str) -> Result<Answer, AnswerError> {
    let json = strip_code_fence(raw.trim());
    let output: ModelOutput = serde_json::from_str(json)
        .map_err(|e| AnswerError::MalformedModelOutput(e.to_string()))?;

    if output.answer.trim().is_empty() {
        return Err(AnswerError::MalformedModelOutput(
            "empty answer".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    let links = output
        .links
        .into_iter()
        .filter(|l| !l.url.trim().is_empty())
        .filter(|l| seen.insert(l.url.trim().to_string()))
        .map(|l| {
            let url = l.url.trim().to_string();
            let text = if l.text.trim().is_empty() {
                url.clone()
            } else {
                l.text.trim().to_string()
            };
            Link { url, text }
        })
        .collect();

    Ok(Answer {
        answer: output.answer.trim().to_string(),
        links,
    })
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string (e.g. "json") on the opening line
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OcrError;
    use crate::llm::DisabledCompleter;
    use crate::models::{ScrapedDocument, Source};
    use crate::ocr::DisabledExtractor;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;
    use std::time::Duration;

    struct ScriptedCompleter {
        output: String,
        delay: Duration,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedCompleter {
        fn new(output: &str) -> Self {
            Self {
                output: output.to_string(),
                delay: Duration::ZERO,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Completer for ScriptedCompleter {
        fn model_name(&self) -> &str {
            "scripted"
        }
        async fn complete(
            &self,
            request: &CompletionRequest,
            _deadline: Instant,
        ) -> Result<String, LlmError> {
            self.seen.lock().unwrap().push(request.user.clone());
            tokio::time::sleep(self.delay).await;
            Ok(self.output.clone())
        }
    }

    struct FixedExtractor(Result<&'static str, ()>);

    #[async_trait]
    impl TextExtractor for FixedExtractor {
        fn name(&self) -> &str {
            "fixed"
        }
        async fn extract_text(&self, _image: &[u8]) -> Result<String, OcrError> {
            self.0
                .map(str::to_string)
                .map_err(|_| OcrError::Engine("boom".to_string()))
        }
    }

    fn store() -> Arc<ContentStore> {
        Arc::new(ContentStore::from_documents(vec![ScrapedDocument {
            source: Source::Github,
            identifier: "web-scraping.md".to_string(),
            title: "Web Scraping Tools".to_string(),
            body: "Use httpx and BeautifulSoup.".to_string(),
            url: "https://tds.example/#web-scraping".to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap(),
        }]))
    }

    fn service(completer: Arc<dyn Completer>, extractor: Arc<dyn TextExtractor>) -> AnswerService {
        AnswerService::new(store(), completer, extractor, &Config::default())
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    const PNG_B64: &str = "iVBORw0KGgoAAAANSUhEUg==";

    #[test]
    fn test_parse_model_output() {
        let answer = parse_model_output(
            r#"{"answer": " Use httpx. ", "links": [
                {"url": "https://a", "text": "A"},
                {"url": "https://a", "text": "dup"},
                {"url": "", "text": "empty"},
                {"url": "https://b"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(answer.answer, "Use httpx.");
        assert_eq!(
            answer.links,
            vec![
                Link { url: "https://a".into(), text: "A".into() },
                Link { url: "https://b".into(), text: "https://b".into() },
            ]
        );
    }

    #[test]
    fn test_parse_fenced_output() {
        let answer = parse_model_output("```json\n{\"answer\": \"fenced\"}\n```").unwrap();
        assert_eq!(answer.answer, "fenced");
        assert!(answer.links.is_empty());
    }

    #[test]
    fn test_parse_plain_text_is_malformed() {
        let err = parse_model_output("Just use httpx.").unwrap_err();
        assert!(matches!(err, AnswerError::MalformedModelOutput(_)));
    }

    #[tokio::test]
    async fn test_empty_question_rejected() {
        let svc = service(
            Arc::new(ScriptedCompleter::new("{}")),
            Arc::new(DisabledExtractor),
        );
        let err = svc.answer(&Question::new("   "), deadline()).await.unwrap_err();
        assert!(matches!(err, AnswerError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_candidate_links_fill_empty_model_links() {
        let svc = service(
            Arc::new(ScriptedCompleter::new(r#"{"answer": "Use httpx.", "links": []}"#)),
            Arc::new(DisabledExtractor),
        );
        let answer = svc
            .answer(&Question::new("Which web scraping tool?"), deadline())
            .await
            .unwrap();
        assert_eq!(answer.answer, "Use httpx.");
        assert_eq!(answer.links[0].url, "https://tds.example/#web-scraping");
    }

    #[tokio::test]
    async fn test_model_links_outside_store_are_dropped() {
        let svc = AnswerService::new(
            Arc::new(ContentStore::empty("absent")),
            Arc::new(ScriptedCompleter::new(
                r#"{"answer": "See the docs.", "links": [{"url": "https://made.up/page", "text": "invented"}]}"#,
            )),
            Arc::new(DisabledExtractor),
            &Config::default(),
        );
        let answer = svc
            .answer(&Question::new("Which web scraping tool?"), deadline())
            .await
            .unwrap();
        assert_eq!(answer.answer, "See the docs.");
        assert!(answer.links.is_empty());
    }

    #[tokio::test]
    async fn test_model_links_keep_retrieved_documents_only() {
        let svc = service(
            Arc::new(ScriptedCompleter::new(
                r#"{"answer": "Use httpx.", "links": [
                    {"url": "https://made.up/page", "text": "invented"},
                    {"url": "https://tds.example/#web-scraping", "text": "model label"}
                ]}"#,
            )),
            Arc::new(DisabledExtractor),
        );
        let answer = svc
            .answer(&Question::new("Which web scraping tool?"), deadline())
            .await
            .unwrap();
        assert_eq!(
            answer.links,
            vec![Link {
                url: "https://tds.example/#web-scraping".into(),
                text: "Web Scraping Tools".into(),
            }]
        );
    }

    #[tokio::test]
    async fn test_queued_request_waits_within_deadline() {
        let mut config = Config::default();
        config.llm.max_in_flight = 1;
        let mut slow = ScriptedCompleter::new(r#"{"answer": "done"}"#);
        slow.delay = Duration::from_millis(400);
        let svc = AnswerService::new(
            store(),
            Arc::new(slow),
            Arc::new(DisabledExtractor),
            &config,
        );

        // Both share a 600ms budget; only one call fits while the other queues
        let shared = Instant::now() + Duration::from_millis(600);
        let question = Question::new("web scraping");
        let (a, b) = tokio::join!(svc.answer(&question, shared), svc.answer(&question, shared));

        let results = [a, b];
        let answered = results.iter().filter(|r| r.is_ok()).count();
        let timed_out = results
            .iter()
            .filter(|r| matches!(r, Err(AnswerError::Timeout)))
            .count();
        assert_eq!((answered, timed_out), (1, 1));
    }

    #[tokio::test]
    async fn test_raw_text_fallback() {
        let svc = service(
            Arc::new(ScriptedCompleter::new("Use httpx, it is great.")),
            Arc::new(DisabledExtractor),
        );
        let answer = svc
            .answer(&Question::new("Which web scraping tool?"), deadline())
            .await
            .unwrap();
        assert_eq!(answer.answer, "Use httpx, it is great.");
        assert!(answer.links.is_empty());
    }

    #[tokio::test]
    async fn test_empty_model_output_is_error() {
        let svc = service(
            Arc::new(ScriptedCompleter::new("  ")),
            Arc::new(DisabledExtractor),
        );
        let err = svc
            .answer(&Question::new("Which web scraping tool?"), deadline())
            .await
            .unwrap_err();
        assert!(matches!(err, AnswerError::MalformedModelOutput(_)));
    }

    #[tokio::test]
    async fn test_slow_model_times_out() {
        let mut slow = ScriptedCompleter::new(r#"{"answer": "late"}"#);
        slow.delay = Duration::from_secs(10);
        let svc = service(Arc::new(slow), Arc::new(DisabledExtractor));
        let started = Instant::now();
        let err = svc
            .answer(
                &Question::new("anything"),
                Instant::now() + Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AnswerError::Timeout));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_disabled_llm_gives_degraded_answer() {
        let svc = service(
            Arc::new(DisabledCompleter::new("OPENAI_API_KEY is not set")),
            Arc::new(DisabledExtractor),
        );
        let answer = svc
            .answer(&Question::new("web scraping"), deadline())
            .await
            .unwrap();
        assert!(answer.answer.contains("unavailable"));
        assert_eq!(answer.links.len(), 1);
    }

    #[tokio::test]
    async fn test_ocr_text_reaches_prompt() {
        let completer = Arc::new(ScriptedCompleter::new(r#"{"answer": "ok"}"#));
        let svc = service(completer.clone(), Arc::new(FixedExtractor(Ok("error 404 in notebook"))));
        svc.answer(&Question::new("what is this?").with_image(PNG_B64), deadline())
            .await
            .unwrap();
        let prompts = completer.seen.lock().unwrap();
        assert!(prompts[0].contains("Image text:\nerror 404 in notebook"));
    }

    #[tokio::test]
    async fn test_ocr_failures_are_ignored() {
        let completer = Arc::new(ScriptedCompleter::new(r#"{"answer": "ok"}"#));
        let svc = service(completer.clone(), Arc::new(FixedExtractor(Err(()))));

        let bad_base64 = Question::new("what is this?").with_image("%%%not-base64%%%");
        assert_eq!(svc.answer(&bad_base64, deadline()).await.unwrap().answer, "ok");

        let engine_error = Question::new("what is this?").with_image(PNG_B64);
        assert_eq!(svc.answer(&engine_error, deadline()).await.unwrap().answer, "ok");

        let prompts = completer.seen.lock().unwrap();
        assert!(prompts.iter().all(|p| !p.contains("Image text")));
    }
}
