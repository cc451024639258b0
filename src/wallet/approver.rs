use std::io::{BufRead, Write};

use crate::wallet::SigningPurpose;

/// Outcome of asking the user to approve a signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Approval {
    Approved,
    Rejected(String),
}

/// The human in the loop for a wallet.
///
/// `approve` is awaited with no timeout: a user may leave a prompt open indefinitely,
/// and only the caller can give up on it.
#[async_trait::async_trait]
pub trait Approver: Send + Sync {
    async fn approve(&self, wallet: &str, purpose: &SigningPurpose) -> Approval;
}

/// Approves everything. For unattended use and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait::async_trait]
impl Approver for AutoApprove {
    async fn approve(&self, _wallet: &str, _purpose: &SigningPurpose) -> Approval {
        Approval::Approved
    }
}

/// Rejects everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

#[async_trait::async_trait]
impl Approver for DenyAll {
    async fn approve(&self, _wallet: &str, _purpose: &SigningPurpose) -> Approval {
        Approval::Rejected("User rejected the request".to_string())
    }
}

/// Asks on the controlling terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalApprover;

#[async_trait::async_trait]
impl Approver for TerminalApprover {
    async fn approve(&self, wallet: &str, purpose: &SigningPurpose) -> Approval {
        let prompt = format!("[{wallet}] {purpose}. Approve? [y/N] ");
        let answer = tokio::task::spawn_blocking(move || {
            let mut stderr = std::io::stderr();
            let _ = write!(stderr, "{prompt}");
            let _ = stderr.flush();
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line).map(|_| line)
        })
        .await;
        match answer {
            Ok(Ok(line)) if matches!(line.trim(), "y" | "Y" | "yes") => Approval::Approved,
            Ok(Ok(_)) => Approval::Rejected("User rejected the request".to_string()),
            Ok(Err(e)) => Approval::Rejected(format!("Could not read approval: {e}")),
            Err(e) => Approval::Rejected(format!("Approval prompt failed: {e}")),
        }
    }
}
