//! Confirmation prompts with CI/non-interactive fallback

use super::context::UiContext;
use crate::error::{FlowboxError, FlowboxResult};
use std::io::{self, BufRead, Write};

/// Ask a yes/no question; `--yes` answers for the user.
///
/// Non-interactive sessions without `--yes` get the default.
pub async fn confirm(ctx: &UiContext, message: &str, default: bool) -> FlowboxResult<bool> {
    if ctx.auto_yes() {
        println!("  {} (auto-approved)", message);
        return Ok(true);
    }
    if !ctx.is_interactive() {
        return Ok(default);
    }

    let message = message.to_string();
    let fancy = ctx.use_fancy_output();
    tokio::task::spawn_blocking(move || {
        if fancy {
            cliclack::confirm(&message).initial_value(default).interact()
        } else {
            confirm_inline(&message, default)
        }
    })
    .await
    .map_err(|e| FlowboxError::User(format!("Prompt task failed: {}", e)))?
    .map_err(|e| FlowboxError::User(format!("Prompt failed: {}", e)))
}

/// Plain `[y/N]` prompt on stdin for terminals without fancy output
fn confirm_inline(message: &str, default: bool) -> io::Result<bool> {
    let suffix = if default { "[Y/n]" } else { "[y/N]" };
    print!("  {} {} ", message, suffix);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().lock().read_line(&mut input)?;
    Ok(match input.trim().to_lowercase().as_str() {
        "y" | "yes" => true,
        "n" | "no" => false,
        _ => default,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn confirm_auto_yes() {
        let ctx = UiContext::non_interactive().with_auto_yes(true);
        assert!(confirm(&ctx, "Remove?", false).await.unwrap());
    }

    #[tokio::test]
    async fn confirm_non_interactive_default() {
        let ctx = UiContext::non_interactive();
        assert!(!confirm(&ctx, "Remove?", false).await.unwrap());
        assert!(confirm(&ctx, "Remove?", true).await.unwrap());
    }
}
