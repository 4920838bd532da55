//! Prompt composition.
//!
//! A composite prompt is a task-specific system preamble, then one
//! `key=value` line per context entry, then the user's prompt.

use std::collections::BTreeMap;

use crate::types::{CompletionRequest, TaskType};

const BASE_SYSTEM: &str = r"You are the FisioFlow assistant for {audience}.
Answer in the language of the question. Be concise and practical.
Never invent patient data that is not in the context.";

const GENERAL: &str = "Help with general clinic questions.";
const ANALYSIS: &str = "Interpret the assessment data provided. State which values are outside expected ranges and what they suggest.";
const MEDICAL: &str = "Answer clinical questions conservatively. Flag red signs that need referral to a physician.";
const EXERCISE: &str = "Prescribe exercises with sets, repetitions, load and progression criteria.";
const RESEARCH: &str = "Summarise the available evidence and say how strong it is.";
const DOCUMENTATION: &str = "Draft clinical notes in SOAP format unless another format is requested.";

/// Replace each `{key}` with its value. Unknown placeholders are left as is.
#[must_use]
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut result = template.to_string();
    for (key, value) in vars {
        result = result.replace(&format!("{{{key}}}"), value);
    }
    result
}

/// System preamble for a task type.
#[must_use]
pub fn system_preamble(task: TaskType) -> String {
    let audience = match task {
        TaskType::General | TaskType::Documentation => "clinic staff",
        TaskType::Analysis | TaskType::Medical | TaskType::Research => "physiotherapists",
        TaskType::Exercise => "physiotherapists and their patients",
    };
    let instruction = match task {
        TaskType::General => GENERAL,
        TaskType::Analysis => ANALYSIS,
        TaskType::Medical => MEDICAL,
        TaskType::Exercise => EXERCISE,
        TaskType::Research => RESEARCH,
        TaskType::Documentation => DOCUMENTATION,
    };
    format!("{}\n{instruction}", render_template(BASE_SYSTEM, &[("audience", audience)]))
}

/// Context lines followed by the prompt.
#[must_use]
pub fn user_message(context: &BTreeMap<String, String>, prompt: &str) -> String {
    let mut out = String::new();
    for (key, value) in context {
        out.push_str(key);
        out.push('=');
        out.push_str(&value.replace('\n', " "));
        out.push('\n');
    }
    if !context.is_empty() {
        out.push('\n');
    }
    out.push_str(prompt);
    out
}

/// Build the full call for one request.
#[must_use]
pub fn compose(
    task: TaskType,
    context: &BTreeMap<String, String>,
    prompt: &str,
    max_tokens: u32,
    temperature: f32,
    timeout_ms: u64,
) -> CompletionRequest {
    CompletionRequest {
        system: system_preamble(task),
        user: user_message(context, prompt),
        max_tokens,
        temperature,
        timeout_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_rendering_leaves_unknown_placeholders() {
        let rendered = render_template("Hello {name}, {unknown}.", &[("name", "Ana")]);
        assert_eq!(rendered, "Hello Ana, {unknown}.");
    }

    #[test]
    fn every_task_has_a_distinct_preamble() {
        let preambles: std::collections::HashSet<String> =
            TaskType::ALL.into_iter().map(system_preamble).collect();
        assert_eq!(preambles.len(), TaskType::ALL.len());
        assert!(system_preamble(TaskType::Exercise).contains("progression"));
        assert!(!system_preamble(TaskType::Medical).contains("{audience}"));
    }

    #[test]
    fn context_lines_precede_prompt_in_key_order() {
        let mut ctx = BTreeMap::new();
        ctx.insert("pain_scale".to_string(), "6".to_string());
        ctx.insert("age".to_string(), "54".to_string());
        let msg = user_message(&ctx, "Plan the next session.");
        assert_eq!(msg, "age=54\npain_scale=6\n\nPlan the next session.");
        assert_eq!(user_message(&BTreeMap::new(), "Hi"), "Hi");
    }
}
