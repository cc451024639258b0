#![allow(dead_code)]

use serde_json::json;
use solana_keypair::Keypair;
use solana_pubkey::Pubkey;
use solana_signature::Signature;
use solana_signer::Signer;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use microapi_x402::chain::{ChainRpc, RpcError, SignatureState, TransactionDetails};
use microapi_x402::types::networks::Network;
use microapi_x402::types::proto::PAYMENT_RESPONSE_HEADER;
use microapi_x402::types::proto::v1::{PaymentRequirements, SettleResponse};
use microapi_x402::types::util::Base64Bytes;
use microapi_x402::wallet::{Approval, Approver, KeySource, KeypairWallet, SigningPurpose};

pub const PAY_TO: &str = "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin";
pub const RESOURCE_PATH: &str = "/api/weather";

/// Approver that counts prompts and answers with a fixed decision.
pub struct CountingApprover {
    pub approve: bool,
    pub prompts: AtomicUsize,
}

impl CountingApprover {
    pub fn approving() -> Arc<Self> {
        Arc::new(Self {
            approve: true,
            prompts: AtomicUsize::new(0),
        })
    }

    pub fn rejecting() -> Arc<Self> {
        Arc::new(Self {
            approve: false,
            prompts: AtomicUsize::new(0),
        })
    }

    pub fn prompts(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Approver for CountingApprover {
    async fn approve(&self, _wallet: &str, _purpose: &SigningPurpose) -> Approval {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        if self.approve {
            Approval::Approved
        } else {
            Approval::Rejected("User rejected the request".to_string())
        }
    }
}

/// A keypair wallet backed by a Solana CLI style key file in `dir`.
pub fn keypair_wallet(
    name: &str,
    dir: &Path,
    approver: Arc<dyn Approver>,
) -> (KeypairWallet, Pubkey) {
    let keypair = Keypair::new();
    let file = dir.join(format!("{name}.json"));
    std::fs::write(
        &file,
        serde_json::to_string(&keypair.to_bytes().to_vec()).unwrap(),
    )
    .unwrap();
    (
        KeypairWallet::new(name, KeySource::File(file), approver),
        keypair.pubkey(),
    )
}

pub fn requirements(server: &MockServer) -> PaymentRequirements {
    serde_json::from_value(json!({
        "scheme": "exact",
        "network": "solana-devnet",
        "maxAmountRequired": "5000",
        "resource": format!("{}{}", server.uri(), RESOURCE_PATH),
        "description": "Current weather",
        "mimeType": "application/json",
        "payTo": PAY_TO,
        "maxTimeoutSeconds": 60,
        "asset": "SOL"
    }))
    .unwrap()
}

/// Mounts a provider that demands payment and settles every paid request as
/// `settlement_signature`.
pub async fn mount_provider(server: &MockServer, settlement_signature: &str) {
    let settlement = SettleResponse::Success {
        payer: None,
        transaction: settlement_signature.to_string(),
        network: "solana-devnet".to_string(),
    };
    let header = Base64Bytes::encode_json(&settlement).unwrap().to_string();
    Mock::given(method("GET"))
        .and(path(RESOURCE_PATH))
        .and(header_exists("X-PAYMENT"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header(PAYMENT_RESPONSE_HEADER, header.as_str())
                .set_body_json(json!({"temperature": 21, "unit": "C"})),
        )
        .with_priority(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(RESOURCE_PATH))
        .respond_with(ResponseTemplate::new(402).set_body_json(json!({
            "x402Version": 1,
            "accepts": [requirements(server)]
        })))
        .with_priority(2)
        .mount(server)
        .await;
}

/// Chain stub answering status queries from a script, then repeating the last answer.
pub struct ChainScript {
    statuses: Mutex<VecDeque<SignatureState>>,
    last: Mutex<SignatureState>,
    pub status_calls: AtomicUsize,
}

impl ChainScript {
    pub fn new(statuses: Vec<SignatureState>) -> Self {
        Self {
            statuses: Mutex::new(statuses.into()),
            last: Mutex::new(SignatureState::Unknown),
            status_calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ChainRpc for ChainScript {
    async fn signature_status(
        &self,
        _network: Network,
        _signature: &Signature,
    ) -> Result<SignatureState, RpcError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let mut last = self.last.lock().unwrap();
        if let Some(next) = self.statuses.lock().unwrap().pop_front() {
            *last = next;
        }
        Ok(last.clone())
    }

    async fn transaction(
        &self,
        _network: Network,
        _signature: &Signature,
    ) -> Result<Option<TransactionDetails>, RpcError> {
        Ok(Some(TransactionDetails {
            slot: Some(250_000_000),
            block_time: Some(1_700_000_000),
            fee: Some(5000),
            error: None,
            payer_balance_change: Some(10_000),
        }))
    }
}
