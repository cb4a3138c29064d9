//! 生成参数：模型默认值与请求覆盖值的合并。
//!
//! Generation parameters: per-model defaults, per-request overrides, and the
//! pure [`merge`] that combines them into [`EffectiveOptions`].
//!
//! Overrides are sparse. A scalar only replaces the default when it is non-zero
//! (numbers) or `true` (flags), so a request cannot ask for an explicit zero.
//! Stop words and embedding inputs are appended to whatever the defaults carry.

use crate::stream::TokenSink;
use crate::types::request::PromptInput;
use serde::{Deserialize, Serialize};

/// Per-model sampling defaults, read from the `parameters` block of a model descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationDefaults {
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: i32,
    pub max_tokens: i32,
    pub repeat_penalty: f64,
    pub keep: i32,
    pub batch: i32,
    pub seed: i32,
    pub mirostat: i32,
    pub mirostat_eta: f64,
    pub mirostat_tau: f64,
    pub threads: i32,
    pub f16: bool,
    pub ignore_eos: bool,
    pub echo: bool,
    #[serde(alias = "stopwords")]
    pub stop: Vec<String>,
}

/// Per-request overrides, flattened into the inbound request body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationOverrides {
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: i32,
    pub max_tokens: i32,
    pub repeat_penalty: f64,
    pub keep: i32,
    pub batch: i32,
    pub seed: i32,
    pub mirostat: i32,
    pub mirostat_eta: f64,
    pub mirostat_tau: f64,
    pub f16: bool,
    pub ignore_eos: bool,
    pub echo: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<PromptInput>,
}

/// The parameter set a single backend call runs with.
///
/// Built once per call by [`merge`] and only read afterwards.
#[derive(Debug, Clone, Default)]
pub struct EffectiveOptions {
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: i32,
    /// 0 means unlimited.
    pub max_tokens: i32,
    pub repeat_penalty: f64,
    pub keep: i32,
    pub batch: i32,
    pub seed: i32,
    pub mirostat: i32,
    pub mirostat_eta: f64,
    pub mirostat_tau: f64,
    pub threads: i32,
    pub f16: bool,
    pub ignore_eos: bool,
    pub echo: bool,
    pub stop: Vec<String>,
    /// Normalized completion prompts.
    pub prompts: Vec<String>,
    /// Normalized embedding inputs.
    pub inputs: Vec<String>,
    /// Installed only for streaming calls.
    pub sink: Option<TokenSink>,
}

impl EffectiveOptions {
    /// Defaults only, as used by a bare `call(prompt)`.
    pub fn from_defaults(defaults: &GenerationDefaults) -> Self {
        merge(defaults, &GenerationOverrides::default(), None, None, None)
    }

    pub fn with_sink(mut self, sink: TokenSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_prompts(mut self, prompts: Vec<String>) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_inputs(mut self, inputs: Vec<String>) -> Self {
        self.inputs = inputs;
        self
    }
}

fn pick<T: PartialEq + Default + Copy>(default: T, requested: T) -> T {
    if requested != T::default() {
        requested
    } else {
        default
    }
}

/// Combine model defaults with request overrides.
///
/// Never mutates `defaults`; the same defaults can serve any number of concurrent calls.
pub fn merge(
    defaults: &GenerationDefaults,
    overrides: &GenerationOverrides,
    prompt: Option<PromptInput>,
    input: Option<PromptInput>,
    sink: Option<TokenSink>,
) -> EffectiveOptions {
    let mut stop = defaults.stop.clone();
    match &overrides.stop {
        Some(PromptInput::Single(s)) if !s.is_empty() => stop.push(s.clone()),
        Some(PromptInput::Many(list)) => stop.extend(list.iter().cloned()),
        _ => {}
    }

    let inputs = match input {
        Some(PromptInput::Single(s)) if s.is_empty() => Vec::new(),
        Some(i) => i.into_vec(),
        None => Vec::new(),
    };

    EffectiveOptions {
        temperature: pick(defaults.temperature, overrides.temperature),
        top_p: pick(defaults.top_p, overrides.top_p),
        top_k: pick(defaults.top_k, overrides.top_k),
        max_tokens: pick(defaults.max_tokens, overrides.max_tokens),
        repeat_penalty: pick(defaults.repeat_penalty, overrides.repeat_penalty),
        keep: pick(defaults.keep, overrides.keep),
        batch: pick(defaults.batch, overrides.batch),
        seed: pick(defaults.seed, overrides.seed),
        mirostat: pick(defaults.mirostat, overrides.mirostat),
        mirostat_eta: pick(defaults.mirostat_eta, overrides.mirostat_eta),
        mirostat_tau: pick(defaults.mirostat_tau, overrides.mirostat_tau),
        threads: defaults.threads,
        f16: defaults.f16 || overrides.f16,
        ignore_eos: defaults.ignore_eos || overrides.ignore_eos,
        echo: defaults.echo || overrides.echo,
        stop,
        prompts: prompt.map(PromptInput::into_vec).unwrap_or_default(),
        inputs,
        sink,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> GenerationDefaults {
        GenerationDefaults {
            temperature: 0.8,
            top_p: 0.9,
            max_tokens: 512,
            stop: vec!["</s>".into()],
            ..Default::default()
        }
    }

    #[test]
    fn non_zero_override_wins() {
        let overrides = GenerationOverrides {
            temperature: 0.1,
            ..Default::default()
        };
        let eff = merge(&defaults(), &overrides, None, None, None);
        assert_eq!(eff.temperature, 0.1);
        assert_eq!(eff.top_p, 0.9);
        assert_eq!(eff.max_tokens, 512);
    }

    #[test]
    fn zero_override_keeps_default() {
        let eff = merge(&defaults(), &GenerationOverrides::default(), None, None, None);
        assert_eq!(eff.temperature, 0.8);
        assert_eq!(eff.max_tokens, 512);
        assert!(!eff.echo);
    }

    #[test]
    fn stop_words_are_appended() {
        let overrides = GenerationOverrides {
            stop: Some(PromptInput::Single("###".into())),
            ..Default::default()
        };
        let eff = merge(&defaults(), &overrides, None, None, None);
        assert_eq!(eff.stop, vec!["</s>", "###"]);

        let overrides = GenerationOverrides {
            stop: Some(PromptInput::Many(vec!["a".into(), "b".into()])),
            ..Default::default()
        };
        let eff = merge(&defaults(), &overrides, None, None, None);
        assert_eq!(eff.stop, vec!["</s>", "a", "b"]);
    }

    #[test]
    fn prompt_and_input_are_normalized() {
        let eff = merge(
            &defaults(),
            &GenerationOverrides::default(),
            Some(PromptInput::Single("p".into())),
            Some(PromptInput::Many(vec!["x".into(), "y".into()])),
            None,
        );
        assert_eq!(eff.prompts, vec!["p"]);
        assert_eq!(eff.inputs, vec!["x", "y"]);

        let eff = merge(
            &defaults(),
            &GenerationOverrides::default(),
            None,
            Some(PromptInput::Single(String::new())),
            None,
        );
        assert!(eff.inputs.is_empty());
    }

    #[test]
    fn merge_leaves_defaults_untouched() {
        let d = defaults();
        let before = d.clone();
        let overrides = GenerationOverrides {
            temperature: 0.3,
            echo: true,
            stop: Some(PromptInput::Single("x".into())),
            ..Default::default()
        };
        let eff = merge(&d, &overrides, None, None, None);
        assert!(eff.echo);
        assert_eq!(d, before);
    }

    #[test]
    fn defaults_accept_stopwords_alias() {
        let d: GenerationDefaults =
            serde_yaml::from_str("temperature: 0.5\nstopwords: [\"User:\"]\n").unwrap();
        assert_eq!(d.stop, vec!["User:"]);
        assert_eq!(d.temperature, 0.5);
    }
}
