//! Thin YooKassa payments API client. The gateway is an opaque collaborator:
//! we create a payment, hand the user the confirmation URL, and later ask
//! for the payment's status.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::CONFIG;
use crate::error::{BotError, BotResult};
use crate::utils::http::get_http_client;

#[derive(Debug, Clone)]
pub struct CreatedPayment {
    pub payment_id: String,
    pub confirmation_url: String,
}

/// Gateway-side payment state, collapsed to what reconciliation needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayStatus {
    Pending,
    Succeeded,
    Canceled,
}

#[derive(Debug, Deserialize)]
struct PaymentResponse {
    id: String,
    status: String,
    confirmation: Option<Confirmation>,
}

#[derive(Debug, Deserialize)]
struct Confirmation {
    confirmation_url: Option<String>,
}

fn parse_status(status: &str) -> GatewayStatus {
    match status {
        "succeeded" => GatewayStatus::Succeeded,
        "canceled" => GatewayStatus::Canceled,
        // "pending" and "waiting_for_capture" both mean: ask again later.
        _ => GatewayStatus::Pending,
    }
}

pub async fn create_payment(
    amount_rub: i64,
    description: &str,
    telegram_id: i64,
) -> BotResult<CreatedPayment> {
    let idempotence_key = Uuid::new_v4().to_string();
    let body = serde_json::json!({
        "amount": {
            "value": format!("{amount_rub}.00"),
            "currency": "RUB"
        },
        "capture": true,
        "confirmation": {
            "type": "redirect",
            "return_url": CONFIG.yookassa_return_url
        },
        "description": description,
        "metadata": { "telegram_id": telegram_id }
    });

    let response = get_http_client()
        .post(format!(
            "{}/payments",
            CONFIG.yookassa_base_url.trim_end_matches('/')
        ))
        .basic_auth(&CONFIG.yookassa_shop_id, Some(&CONFIG.yookassa_secret_key))
        .header("Idempotence-Key", idempotence_key)
        .timeout(Duration::from_secs(30))
        .json(&body)
        .send()
        .await
        .map_err(|err| gateway_error(err))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        warn!("YooKassa create payment failed: status={status}, body={body}");
        return Err(BotError::ServiceError {
            message: format!("payment gateway error {status}"),
            retryable: status.is_server_error(),
        });
    }

    let payment: PaymentResponse = response.json().await.map_err(|err| BotError::ServiceError {
        message: format!("malformed gateway response: {err}"),
        retryable: false,
    })?;

    let confirmation_url = payment
        .confirmation
        .and_then(|c| c.confirmation_url)
        .ok_or_else(|| BotError::ServiceError {
            message: "gateway response missing confirmation URL".to_string(),
            retryable: false,
        })?;

    debug!("Created YooKassa payment {}", payment.id);
    Ok(CreatedPayment {
        payment_id: payment.id,
        confirmation_url,
    })
}

pub async fn fetch_payment_status(payment_id: &str) -> BotResult<GatewayStatus> {
    let response = get_http_client()
        .get(format!(
            "{}/payments/{payment_id}",
            CONFIG.yookassa_base_url.trim_end_matches('/')
        ))
        .basic_auth(&CONFIG.yookassa_shop_id, Some(&CONFIG.yookassa_secret_key))
        .timeout(Duration::from_secs(30))
        .send()
        .await
        .map_err(gateway_error)?;

    if !response.status().is_success() {
        let status = response.status();
        warn!("YooKassa status check for {payment_id} failed: {status}");
        return Err(BotError::ServiceError {
            message: format!("payment gateway error {status}"),
            retryable: status.is_server_error(),
        });
    }

    let payment: PaymentResponse = response.json().await.map_err(|err| BotError::ServiceError {
        message: format!("malformed gateway response: {err}"),
        retryable: false,
    })?;

    Ok(parse_status(&payment.status))
}

fn gateway_error(err: reqwest::Error) -> BotError {
    if err.is_timeout() {
        BotError::ServiceTimeout(30)
    } else {
        BotError::ServiceError {
            message: err.to_string(),
            retryable: err.is_connect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_statuses_collapse_to_three_outcomes() {
        assert_eq!(parse_status("succeeded"), GatewayStatus::Succeeded);
        assert_eq!(parse_status("canceled"), GatewayStatus::Canceled);
        assert_eq!(parse_status("pending"), GatewayStatus::Pending);
        assert_eq!(parse_status("waiting_for_capture"), GatewayStatus::Pending);
    }
}
