use crate::types::response::{ChatResponse, Choice, CompletionResponse, Usage};
use crate::Result;
use std::future::Future;

/// Choices (and token usage) gathered from one or more generation rounds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Generation {
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

impl From<Vec<Choice>> for Generation {
    fn from(choices: Vec<Choice>) -> Self {
        Self {
            choices,
            usage: Usage::default(),
        }
    }
}

impl From<ChatResponse> for Generation {
    fn from(resp: ChatResponse) -> Self {
        Self {
            choices: resp.choices,
            usage: resp.usage,
        }
    }
}

impl From<CompletionResponse> for Generation {
    fn from(resp: CompletionResponse) -> Self {
        Self {
            choices: resp.choices,
            usage: resp.usage,
        }
    }
}

/// Run one generation `n` times in sequence and collect the choices in call order.
///
/// `n == 0` is treated as 1. The first failure is returned as-is and everything
/// generated before it is discarded. A round may yield several choices (one per
/// completion prompt); indices are reassigned to be contiguous across the whole list.
pub async fn compute_choices<F, Fut, R>(n: u32, mut generate: F) -> Result<Generation>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<R>>,
    R: Into<Generation>,
{
    let n = n.max(1);
    let mut out = Generation {
        choices: Vec::with_capacity(n as usize),
        usage: Usage::default(),
    };
    for round in 0..n {
        let generation: Generation = generate(round).await?.into();
        out.usage.add(&generation.usage);
        for choice in generation.choices {
            let index = out.choices.len() as u32;
            out.choices.push(choice.with_index(index));
        }
    }
    Ok(out)
}
