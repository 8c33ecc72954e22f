// ── Chatvend Engine: Payment Gateway (Zarinpal) ────────────────────────────
// Zarinpal v4 REST client over the payment-request / verify pair, plus a
// thin refund pass-through against the authenticated API.
//
// Status codes that matter:
//   100 — verified now (first verify for this authority)
//   101 — already verified; the gateway returns the same ref-id again.
// Both count as success; the caller's conditional status write decides
// who actually grants the subscription.

use async_trait::async_trait;
use log::{info, warn};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

use crate::atoms::constants::GATEWAY_TIMEOUT_SECS;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{RefundMethod, RefundReceipt};

// ── Port ───────────────────────────────────────────────────────────────────

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &str;
    /// Start a payment intent. Returns (authority, redirect URL).
    async fn request_payment(
        &self,
        amount_irr: i64,
        description: &str,
        callback_url: &str,
        metadata: &Value,
    ) -> EngineResult<(String, String)>;
    /// Verify an authority against the expected amount. Returns the
    /// gateway ref-id; "already verified" with a ref-id is success.
    async fn verify_payment(&self, authority: &str, expected_amount_irr: i64)
        -> EngineResult<String>;
    async fn refund_payment(
        &self,
        session_id: &str,
        amount_irr: i64,
        description: &str,
        method: RefundMethod,
        reason: &str,
    ) -> EngineResult<RefundReceipt>;
}

// ── Zarinpal ───────────────────────────────────────────────────────────────

pub struct ZarinpalGateway {
    client: Client,
    merchant_id: String,
    sandbox: bool,
    access_token: Option<String>,
}

impl ZarinpalGateway {
    pub fn new(cfg: &crate::atoms::config::ZarinpalConfig) -> Self {
        ZarinpalGateway {
            client: Client::builder()
                .timeout(Duration::from_secs(GATEWAY_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
            merchant_id: cfg.merchant_id.clone(),
            sandbox: cfg.sandbox,
            access_token: cfg.access_token.clone(),
        }
    }

    fn host(&self) -> &str {
        if self.sandbox {
            "https://sandbox.zarinpal.com"
        } else {
            "https://payment.zarinpal.com"
        }
    }

    fn start_pay_url(&self, authority: &str) -> String {
        format!("{}/pg/StartPay/{}", self.host(), authority)
    }

    /// Zarinpal wraps everything in {data, errors}; a non-empty errors
    /// object carries {code, message}.
    fn unwrap_envelope(v: Value, op: &str) -> EngineResult<Value> {
        if let Some(err) = v.get("errors").filter(|e| !e.is_null() && !is_empty_errors(e)) {
            let code = err["code"].as_i64().unwrap_or(0);
            let message = err["message"].as_str().unwrap_or("unknown error");
            return Err(EngineError::gateway(
                "zarinpal",
                format!("{}: code {}: {}", op, code, message),
            ));
        }
        Ok(v["data"].clone())
    }
}

fn is_empty_errors(e: &Value) -> bool {
    e.as_array().map(|a| a.is_empty()).unwrap_or(false)
        || e.as_object().map(|o| o.is_empty()).unwrap_or(false)
}

#[async_trait]
impl PaymentGateway for ZarinpalGateway {
    fn name(&self) -> &str {
        "zarinpal"
    }

    async fn request_payment(
        &self,
        amount_irr: i64,
        description: &str,
        callback_url: &str,
        metadata: &Value,
    ) -> EngineResult<(String, String)> {
        let url = format!("{}/pg/v4/payment/request.json", self.host());
        let body = json!({
            "merchant_id": self.merchant_id,
            "amount": amount_irr,
            "currency": "IRR",
            "callback_url": callback_url,
            "description": description,
            "metadata": metadata,
        });
        let resp = self.client.post(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(EngineError::gateway(
                "zarinpal",
                format!("request: HTTP {}", resp.status()),
            ));
        }
        let data = Self::unwrap_envelope(resp.json().await?, "request")?;
        let code = data["code"].as_i64().unwrap_or(0);
        if code != 100 {
            return Err(EngineError::gateway("zarinpal", format!("request rejected: code {}", code)));
        }
        let authority = data["authority"]
            .as_str()
            .ok_or_else(|| EngineError::gateway("zarinpal", "request: no authority in response"))?
            .to_string();
        let pay_url = self.start_pay_url(&authority);
        info!("[zarinpal] Payment intent opened, authority {}", authority);
        Ok((authority, pay_url))
    }

    async fn verify_payment(
        &self,
        authority: &str,
        expected_amount_irr: i64,
    ) -> EngineResult<String> {
        let url = format!("{}/pg/v4/payment/verify.json", self.host());
        let body = json!({
            "merchant_id": self.merchant_id,
            "amount": expected_amount_irr,
            "authority": authority,
        });
        let resp = self.client.post(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(EngineError::gateway("zarinpal", format!("verify: HTTP {}", resp.status())));
        }
        let data = Self::unwrap_envelope(resp.json().await?, "verify")?;
        let code = data["code"].as_i64().unwrap_or(0);
        match code {
            // 100 = verified now, 101 = verified on an earlier call; both
            // return the settlement ref-id.
            100 | 101 => {
                let ref_id = data["ref_id"]
                    .as_i64()
                    .map(|n| n.to_string())
                    .or_else(|| data["ref_id"].as_str().map(str::to_string))
                    .ok_or_else(|| {
                        EngineError::gateway("zarinpal", "verify: no ref_id in response")
                    })?;
                if code == 101 {
                    warn!("[zarinpal] Authority {} was already verified (ref {})", authority, ref_id);
                }
                Ok(ref_id)
            }
            other => Err(EngineError::gateway(
                "zarinpal",
                format!("verify failed for {}: code {}", authority, other),
            )),
        }
    }

    async fn refund_payment(
        &self,
        session_id: &str,
        amount_irr: i64,
        description: &str,
        method: RefundMethod,
        reason: &str,
    ) -> EngineResult<RefundReceipt> {
        let token = self.access_token.as_deref().ok_or_else(|| {
            EngineError::Config("payment.zarinpal.access_token is required for refunds".into())
        })?;
        let method = match method {
            RefundMethod::Paya => "PAYA",
            RefundMethod::Card => "CARD",
        };
        let body = json!({
            "query": "mutation AddRefund($session_id: ID!, $amount: BigInteger!, $description: String, $method: InstantPayoutActionTypeEnum, $reason: RefundReasonEnum) { resource: AddRefund(session_id: $session_id, amount: $amount, description: $description, method: $method, reason: $reason) { id, status, amount, updated_at } }",
            "variables": {
                "session_id": session_id,
                "amount": amount_irr,
                "description": description,
                "method": method,
                "reason": reason,
            }
        });
        let resp = self
            .client
            .post("https://api.zarinpal.com/api/v4/graphql")
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(EngineError::gateway("zarinpal", format!("refund: HTTP {}", resp.status())));
        }
        let v: Value = resp.json().await?;
        if let Some(errors) = v.get("errors").filter(|e| !e.is_null() && !is_empty_errors(e)) {
            return Err(EngineError::gateway("zarinpal", format!("refund: {}", errors)));
        }
        let r = &v["data"]["resource"];
        Ok(RefundReceipt {
            id: r["id"].as_str().unwrap_or_default().to_string(),
            status: r["status"].as_str().unwrap_or_default().to_string(),
            refund_amount: r["amount"].as_i64().unwrap_or(amount_irr),
            refund_time: r["updated_at"].as_str().unwrap_or_default().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gw(sandbox: bool) -> ZarinpalGateway {
        ZarinpalGateway {
            client: Client::new(),
            merchant_id: "m".into(),
            sandbox,
            access_token: None,
        }
    }

    #[test]
    fn sandbox_switches_host() {
        assert!(gw(true).start_pay_url("A1").starts_with("https://sandbox.zarinpal.com"));
        assert!(gw(false).start_pay_url("A1").starts_with("https://payment.zarinpal.com"));
    }

    #[test]
    fn envelope_surfaces_gateway_errors() {
        let v = json!({"data": [], "errors": {"code": -9, "message": "validation error"}});
        let err = ZarinpalGateway::unwrap_envelope(v, "request").unwrap_err();
        assert!(err.to_string().contains("-9"));

        let ok = json!({"data": {"code": 100, "authority": "A1"}, "errors": []});
        let data = ZarinpalGateway::unwrap_envelope(ok, "request").unwrap();
        assert_eq!(data["authority"], "A1");
    }
}
