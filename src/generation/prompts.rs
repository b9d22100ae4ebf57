//! Prompt builders for endpoint generation

use super::client::EvolveRequest;

pub const SYSTEM_PROMPT: &str = "You write bodies for HTTP endpoints in a tiny scripting language. \
Reply with code only: no explanations, no markdown.";

const LANGUAGE_GUIDE: &str = r#"The language:
- `let name = <expr>` binds a local
- `return <expr>` ends the body with a value
- `throw <expr>` fails the request with a message
- expressions: "strings", numbers, true, false, null, locals, `input`, `value.field`, `a + b`
- capabilities are called as `actions.<name>(arg, ...)`; nothing else is callable
- there are no loops, functions, or methods on values
The variable `input` is already defined (the request input, may be null). Do not redeclare `input` or `actions`."#;

fn capability_list(capabilities: &[String]) -> String {
    if capabilities.is_empty() {
        "(none)".to_string()
    } else {
        capabilities.join(", ")
    }
}

pub fn spawn_prompt(path: &str, capabilities: &[String]) -> String {
    format!(
        "Write the body for an endpoint called \"{path}\".\n\n{LANGUAGE_GUIDE}\n\nAvailable actions: {caps}\nExample: return actions.return(input)\n\nReturn ONLY the body code.",
        path = path,
        caps = capability_list(capabilities),
    )
}

pub fn evolve_prompt(request: &EvolveRequest) -> String {
    format!(
        "This endpoint is failing. Improve the code to make it work better.\n\n\
Path: {path}\nCurrent code:\n{code}\n\nLast error: {error}\nFailures: {failures}\nSuccess rate: {successes}/{uses}\n\n\
{LANGUAGE_GUIDE}\n\nAvailable actions: {caps}\n\nYou can ONLY use the available actions. Return ONLY the improved body code.",
        path = request.path,
        code = request.code,
        error = request.last_error.as_deref().unwrap_or("Unknown"),
        failures = request.failures,
        successes = request.uses.saturating_sub(request.failures),
        uses = request.uses,
        caps = capability_list(&request.capabilities),
    )
}

pub fn sanitize_prompt(path: &str, capabilities: &[String]) -> String {
    format!(
        "An endpoint named \"{path}\" was requested but cannot be built as asked. \
Propose a harmless, useful endpoint inspired by the name instead.\n\n{LANGUAGE_GUIDE}\n\nAvailable actions: {caps}\n\n\
Reply with a single JSON object and nothing else: {{\"path\": \"/new-name\", \"code\": \"<body code>\"}}",
        path = path,
        caps = capability_list(capabilities),
    )
}
