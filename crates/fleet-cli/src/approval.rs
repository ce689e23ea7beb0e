use async_trait::async_trait;
use fleet_core::{ApprovalDecision, ApprovalHandler, ApprovalRequest, FleetResult};
use std::time::Duration;

/// Prompts on stderr and reads the reviewer's answer from stdin.
///
/// stdout stays reserved for the SSE frames of the run, so the prompt never
/// interleaves with piped output.
pub struct StdinApprovalHandler {
    timeout: Duration,
}

impl StdinApprovalHandler {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

pub fn format_approval_prompt(request: &ApprovalRequest) -> String {
    let mut prompt = String::new();
    prompt.push_str("\n\x1b[1;37m== APPROVAL REQUIRED ==\x1b[0m\n");
    prompt.push_str(&format!("  Request: {}\n", request.request_id));
    prompt.push_str(&format!(
        "  Agent:   \x1b[33m{}\x1b[0m ({})\n",
        request.agent_name, request.operation_type
    ));
    prompt.push_str(&format!("  Action:  {}\n", request.operation));
    if let Some(code) = &request.code {
        prompt.push_str(&format!("  Code:\n{code}\n"));
    }
    if !request.details.is_null() {
        prompt.push_str(&format!("  Details: {}\n", request.details));
    }
    prompt.push_str("  Approve? [y/N/reason]: ");
    prompt
}

/// `y`/`yes` approves; `n`/`no`/empty rejects; anything else rejects with
/// the text as feedback.
pub fn parse_approval_input(input: &str, reviewer: &str) -> ApprovalDecision {
    let trimmed = input.trim();
    match trimmed.to_lowercase().as_str() {
        "y" | "yes" => ApprovalDecision::approved(reviewer),
        "n" | "no" | "" => ApprovalDecision::rejected("", reviewer),
        _ => ApprovalDecision::rejected(trimmed, reviewer),
    }
}

fn reviewer() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "cli-user".to_string())
}

#[async_trait]
impl ApprovalHandler for StdinApprovalHandler {
    async fn request_approval(&self, request: ApprovalRequest) -> FleetResult<ApprovalDecision> {
        eprint!("{}", format_approval_prompt(&request));

        let result = tokio::time::timeout(
            self.timeout,
            tokio::task::spawn_blocking(|| {
                let mut input = String::new();
                std::io::stdin().read_line(&mut input).map(|_| input)
            }),
        )
        .await;

        let reviewer = reviewer();
        let decision = match result {
            Ok(Ok(Ok(input))) => parse_approval_input(&input, &reviewer),
            Ok(_) => ApprovalDecision::rejected("stdin read error", reviewer),
            Err(_) => ApprovalDecision::rejected(
                format!("Timed out after {}s", self.timeout.as_secs()),
                reviewer,
            ),
        };
        eprintln!("  -> {:?}\n", decision.status);
        Ok(decision)
    }
}
