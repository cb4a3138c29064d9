//! End-to-end request flow through the gateway with a scripted native engine.

use futures::StreamExt;
use llm_chain_gateway::backend::native::{
    EngineFailure, EngineLoader, EngineParams, NativeBackend, NativeEngine, TokenCallback,
};
use llm_chain_gateway::chain::BASE_CHAT_CHAIN;
use llm_chain_gateway::config::GatewayConfig;
use llm_chain_gateway::{
    Backend, ChainRegistry, ChatMessage, EffectiveOptions, Error, Gateway, GatewayReply,
    GenerationDefaults, GenerationOverrides, ModelRegistry, PromptInput, StreamEvent,
    UnifiedRequest,
};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What the engine saw and did, shared with the test.
#[derive(Default)]
struct Probe {
    predictions: AtomicUsize,
    tokens_emitted: AtomicUsize,
    freed: AtomicUsize,
    last_prompt: Mutex<String>,
    last_temperature: Mutex<f64>,
    last_stop: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Streams `tokens` through the callback, then answers `"<tokens> #<call>"`.
struct ScriptedEngine {
    tokens: Vec<String>,
    delay: Duration,
    callback: Option<TokenCallback>,
    probe: Arc<Probe>,
}

impl NativeEngine for ScriptedEngine {
    fn set_token_callback(&mut self, callback: Option<TokenCallback>) {
        self.callback = callback;
    }

    fn predict(
        &mut self,
        prompt: &str,
        options: &EffectiveOptions,
    ) -> Result<String, EngineFailure> {
        let call = self.probe.predictions.fetch_add(1, Ordering::SeqCst);
        let now = self.probe.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.max_in_flight.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(self.delay.max(Duration::from_millis(1)));
        self.probe.in_flight.fetch_sub(1, Ordering::SeqCst);
        *self.probe.last_prompt.lock().unwrap() = prompt.to_string();
        *self.probe.last_temperature.lock().unwrap() = options.temperature;
        *self.probe.last_stop.lock().unwrap() = options.stop.clone();
        if prompt.contains("explode") {
            return Err(EngineFailure::new(7, "out of memory"));
        }

        let mut text = String::new();
        for t in &self.tokens {
            if let Some(cb) = self.callback.as_mut() {
                if !cb(t.as_str()) {
                    break;
                }
                self.probe.tokens_emitted.fetch_add(1, Ordering::SeqCst);
            }
            text.push_str(t);
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
        }
        Ok(format!("{} #{}", text, call))
    }

    fn embed(
        &mut self,
        text: &str,
        _options: &EffectiveOptions,
    ) -> Result<Vec<f32>, EngineFailure> {
        Ok(vec![text.len() as f32, 0.0])
    }

    fn free(&mut self) {
        self.probe.freed.fetch_add(1, Ordering::SeqCst);
    }
}

fn engine(tokens: &[&str], probe: &Arc<Probe>) -> Box<dyn NativeEngine> {
    Box::new(ScriptedEngine {
        tokens: tokens.iter().map(|t| t.to_string()).collect(),
        delay: Duration::ZERO,
        callback: None,
        probe: probe.clone(),
    })
}

fn gateway_with(backend: NativeBackend, chains: ChainRegistry) -> Gateway {
    Gateway::new(ModelRegistry::from_backends(vec![Arc::new(backend)]).unwrap(), chains)
}

fn user(text: &str) -> Vec<ChatMessage> {
    vec![ChatMessage::user(text)]
}

#[tokio::test]
async fn zero_override_keeps_model_default() {
    let probe = Arc::new(Probe::default());
    let backend =
        NativeBackend::new("local", engine(&["ok"], &probe)).with_defaults(GenerationDefaults {
            temperature: 0.8,
            max_tokens: 128,
            ..Default::default()
        });
    let gateway = gateway_with(backend, ChainRegistry::with_defaults());

    gateway.chat(UnifiedRequest::chat("local", user("q"))).await.unwrap();
    assert_eq!(*probe.last_temperature.lock().unwrap(), 0.8);

    let req = UnifiedRequest::chat("local", user("q")).with_overrides(GenerationOverrides {
        temperature: 0.2,
        ..Default::default()
    });
    gateway.chat(req).await.unwrap();
    assert_eq!(*probe.last_temperature.lock().unwrap(), 0.2);
}

#[tokio::test]
async fn request_stop_words_append_to_defaults() {
    let probe = Arc::new(Probe::default());
    let backend =
        NativeBackend::new("local", engine(&["ok"], &probe)).with_defaults(GenerationDefaults {
            stop: vec!["\n".into()],
            ..Default::default()
        });
    let gateway = gateway_with(backend, ChainRegistry::with_defaults());

    let req = UnifiedRequest::chat("local", user("q")).with_overrides(GenerationOverrides {
        stop: Some(PromptInput::Many(vec!["END".into()])),
        ..Default::default()
    });
    gateway.chat(req).await.unwrap();
    assert_eq!(*probe.last_stop.lock().unwrap(), vec!["\n", "END"]);
}

#[tokio::test]
async fn streamed_tokens_arrive_in_order_then_stop() {
    let probe = Arc::new(Probe::default());
    let gateway = gateway_with(
        NativeBackend::new("local", engine(&["He", "llo"], &probe)),
        ChainRegistry::with_defaults(),
    );

    let req = UnifiedRequest::chat("local", user("greet")).with_stream(true);
    let reply = gateway.chat(req).await.unwrap();
    assert!(reply.is_stream());
    let chunks: Vec<_> = reply.into_stream().unwrap().into_chunks().collect().await;

    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].choices[0].content(), "He");
    assert_eq!(chunks[1].choices[0].content(), "llo");
    assert_eq!(chunks[2].choices[0].finish_reason.as_deref(), Some("stop"));
    assert!(chunks[..2].iter().all(|c| c.choices[0].finish_reason.is_none()));
}

#[tokio::test]
async fn three_choices_in_call_order() {
    let probe = Arc::new(Probe::default());
    let gateway = gateway_with(
        NativeBackend::new("local", engine(&["x"], &probe)),
        ChainRegistry::with_defaults(),
    );

    let req = UnifiedRequest::chat("local", user("q")).with_n(3);
    let resp = match gateway.chat(req).await.unwrap() {
        GatewayReply::Complete(resp) => resp,
        GatewayReply::Stream(_) => panic!("expected a complete reply"),
    };
    let texts: Vec<_> = resp.choices.iter().map(|c| c.content().to_string()).collect();
    assert_eq!(texts, ["x #0", "x #1", "x #2"]);
    assert_eq!(probe.predictions.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn failure_in_any_round_returns_only_the_error() {
    let probe = Arc::new(Probe::default());
    let gateway = gateway_with(
        NativeBackend::new("local", engine(&["x"], &probe)),
        ChainRegistry::with_defaults(),
    );
    let err = gateway
        .completion(UnifiedRequest::completion("local", "explode").with_n(3))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Inference { code: 7, .. }));
    assert_eq!(probe.predictions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stream_failing_before_first_token_returns_the_error() {
    let probe = Arc::new(Probe::default());
    let gateway = gateway_with(
        NativeBackend::new("local", engine(&["x"], &probe)),
        ChainRegistry::with_defaults(),
    );
    let err = gateway
        .completion(UnifiedRequest::completion("local", "explode").with_stream(true))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Inference { code: 7, .. }));
}

#[tokio::test]
async fn native_backend_runs_one_generation_at_a_time() {
    let probe = Arc::new(Probe::default());
    let slow = ScriptedEngine {
        tokens: vec!["a".into(), "b".into()],
        delay: Duration::from_millis(20),
        callback: None,
        probe: probe.clone(),
    };
    let backend = Arc::new(NativeBackend::new("local", Box::new(slow)));

    let (first, second) = tokio::join!(backend.call("one"), backend.call("two"));
    first.unwrap();
    second.unwrap();
    assert_eq!(probe.predictions.load(Ordering::SeqCst), 2);
    assert_eq!(probe.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_model_is_a_structured_404() {
    let probe = Arc::new(Probe::default());
    let gateway = gateway_with(
        NativeBackend::new("local", engine(&["x"], &probe)),
        ChainRegistry::with_defaults(),
    );
    let err = gateway
        .chat(UnifiedRequest::chat("nonexistent", user("q")))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 404);
    let body = err.to_response();
    assert_eq!(body.error.code, 1000);
    assert_eq!(body.error.r#type, "model_not_found");

    // Registry unchanged; the known model still serves.
    assert_eq!(gateway.list_models().data.len(), 1);
    assert!(gateway.chat(UnifiedRequest::chat("local", user("q"))).await.is_ok());
}

#[tokio::test]
async fn identity_chain_is_transparent() {
    let direct_probe = Arc::new(Probe::default());
    let chained_probe = Arc::new(Probe::default());
    let direct = gateway_with(
        NativeBackend::new("local", engine(&["same"], &direct_probe)),
        ChainRegistry::with_defaults(),
    );
    let chained = gateway_with(
        NativeBackend::new("local", engine(&["same"], &chained_probe)),
        ChainRegistry::with_defaults(),
    );

    let a = direct
        .chat(UnifiedRequest::chat("local", user("hello")))
        .await
        .unwrap()
        .into_complete()
        .unwrap();
    let b = chained
        .chat(UnifiedRequest::chat("local", user("hello")).with_chain(BASE_CHAT_CHAIN))
        .await
        .unwrap()
        .into_complete()
        .unwrap();
    assert_eq!(a.content(), b.content());
    assert_eq!(
        *direct_probe.last_prompt.lock().unwrap(),
        *chained_probe.last_prompt.lock().unwrap()
    );
}

#[tokio::test]
async fn failed_prompt_transform_skips_the_backend() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("prompts")).unwrap();
    std::fs::write(dir.path().join("prompts/qa.tmpl"), "Q: {{.input}} ({{.context}})").unwrap();
    std::fs::create_dir(dir.path().join("models")).unwrap();
    std::fs::write(dir.path().join("models/local.bin"), b"weights").unwrap();

    let probe = Arc::new(Probe::default());
    let config = config_in(
        dir.path(),
        r#"
models:
  - name: local
    kind: native
    settings: { model_file: local.bin }
chains:
  - name: qa_chain
    template: qa
  - name: missing_chain
    template: nowhere
"#,
    );
    let gateway = Gateway::from_config(&config, Some(loader(&probe, &[]))).await.unwrap();

    let err = gateway
        .chat(UnifiedRequest::chat("local", user("why")).with_chain("qa_chain"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Template { .. }));
    let err = gateway
        .completion(UnifiedRequest::completion("local", "why").with_chain("missing_chain"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Template { .. }));

    // Streaming requests surface the same error instead of an empty stream.
    let err = gateway
        .chat(
            UnifiedRequest::chat("local", user("why"))
                .with_chain("qa_chain")
                .with_stream(true),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Template { .. }));
    assert_eq!(err.status_code(), 400);
    assert_eq!(probe.predictions.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn configured_template_chain_rewrites_prompt() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("prompts")).unwrap();
    std::fs::write(dir.path().join("prompts/qa.tmpl"), "Question: {{.input}}").unwrap();
    std::fs::create_dir(dir.path().join("models")).unwrap();
    std::fs::write(dir.path().join("models/local.bin"), b"weights").unwrap();

    let probe = Arc::new(Probe::default());
    let config = config_in(
        dir.path(),
        r#"
models:
  - name: local
    kind: native
    settings: { model_file: local.bin }
chains:
  - name: qa_chain
    template: qa
"#,
    );
    let gateway = Gateway::from_config(&config, Some(loader(&probe, &["ok"]))).await.unwrap();
    gateway
        .completion(UnifiedRequest::completion("local", "why").with_chain("qa_chain"))
        .await
        .unwrap();
    assert_eq!(*probe.last_prompt.lock().unwrap(), "Question: why");

    gateway.shutdown().await;
    assert_eq!(probe.freed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn registry_load_is_fail_fast_and_releases_loaded_models() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("models")).unwrap();
    std::fs::write(dir.path().join("models/first.bin"), b"weights").unwrap();

    let probe = Arc::new(Probe::default());
    let config = config_in(
        dir.path(),
        r#"
models:
  - name: first
    kind: native
    settings: { model_file: first.bin }
  - name: second
    kind: native
    settings: { model_file: not-there.bin }
"#,
    );
    let err = Gateway::from_config(&config, Some(loader(&probe, &[]))).await.unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));
    assert_eq!(probe.freed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn native_model_without_engine_is_configuration_error() {
    let config = GatewayConfig::from_yaml_str("models:\n  - name: ggml-llama-7b\n").unwrap();
    let err = Gateway::from_config(&config, None).await.unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));
}

#[tokio::test]
async fn dropping_the_stream_stops_native_generation() {
    let probe = Arc::new(Probe::default());
    let slow = ScriptedEngine {
        tokens: (0..200).map(|i| format!("t{} ", i)).collect(),
        delay: Duration::from_millis(5),
        callback: None,
        probe: probe.clone(),
    };
    let gateway = gateway_with(
        NativeBackend::new("local", Box::new(slow)),
        ChainRegistry::with_defaults(),
    );

    let mut stream = gateway
        .chat(UnifiedRequest::chat("local", user("go")).with_stream(true))
        .await
        .unwrap()
        .into_stream()
        .unwrap();
    assert!(matches!(stream.next().await, Some(StreamEvent::Delta(_))));
    drop(stream);

    // Engine lock is released once the generation unwinds; a follow-up call proves it.
    let resp = tokio::time::timeout(
        Duration::from_secs(5),
        gateway.chat(UnifiedRequest::chat("local", user("again"))),
    )
    .await
    .expect("generation kept running after the consumer left")
    .unwrap();
    assert!(resp.into_complete().is_some());
    assert!(probe.tokens_emitted.load(Ordering::SeqCst) < 50);
}

#[tokio::test]
async fn cancel_token_ends_stream_early() {
    let probe = Arc::new(Probe::default());
    let tokens: Vec<String> = (0..100).map(|i| format!("{} ", i)).collect();
    let slow = ScriptedEngine {
        tokens,
        delay: Duration::from_millis(5),
        callback: None,
        probe: probe.clone(),
    };
    let gateway = gateway_with(
        NativeBackend::new("local", Box::new(slow)),
        ChainRegistry::with_defaults(),
    );

    let cancel = CancellationToken::new();
    let stream = gateway
        .chat_with_cancel(
            UnifiedRequest::chat("local", user("go")).with_stream(true),
            cancel.clone(),
        )
        .await
        .unwrap()
        .into_stream()
        .unwrap();

    let trigger = cancel.clone();
    let events: Vec<_> = stream
        .enumerate()
        .map(move |(i, e)| {
            if i == 2 {
                trigger.cancel();
            }
            e
        })
        .collect()
        .await;
    assert!(events.last().unwrap().is_terminal());
    assert!(events.len() < 100);
}

fn config_in(root: &Path, models_yaml: &str) -> GatewayConfig {
    let mut config = GatewayConfig::from_yaml_str(models_yaml).unwrap();
    config.model_path = root.join("models");
    config.prompt_path = root.join("prompts");
    config.validate().unwrap();
    config
}

struct ScriptedLoader {
    tokens: Vec<String>,
    probe: Arc<Probe>,
}

impl EngineLoader for ScriptedLoader {
    fn load(
        &self,
        _path: &Path,
        _params: &EngineParams,
    ) -> Result<Box<dyn NativeEngine>, EngineFailure> {
        Ok(Box::new(ScriptedEngine {
            tokens: self.tokens.clone(),
            delay: Duration::ZERO,
            callback: None,
            probe: self.probe.clone(),
        }))
    }
}

fn loader(probe: &Arc<Probe>, tokens: &[&str]) -> Arc<dyn EngineLoader> {
    Arc::new(ScriptedLoader {
        tokens: tokens.iter().map(|t| t.to_string()).collect(),
        probe: probe.clone(),
    })
}
