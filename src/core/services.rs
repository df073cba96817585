//! External service seams - payment gateway and identity provider.
//!
//! The ledger never talks to a concrete provider. Callers pass an implementation
//! of these traits into the operations that need one (stripe refunds, merge
//! account clean-up), which keeps the core free of global clients.

use crate::errors::Error;
use async_trait::async_trait;
use thiserror::Error;

/// Failure reported by an external provider.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The referenced payment, refund or account does not exist at the provider
    #[error("not found: {0}")]
    NotFound(String),
    /// Any other provider failure
    #[error("{0}")]
    Failed(String),
}

impl ServiceError {
    /// Converts into the crate error, naming the service that failed.
    #[must_use]
    pub fn into_error(self, service: &str) -> Error {
        Error::ExternalService {
            service: service.to_string(),
            message: self.to_string(),
        }
    }
}

/// Handle returned by the payment gateway for an issued refund.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundReceipt {
    /// Gateway refund id
    pub refund_id: String,
}

/// Payment gateway able to return money for an online payment.
///
/// Refunds issued through the gateway move real money and cannot be reversed
/// from inside the studio ledger.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Refunds `amount` of the payment identified by `payment_intent_id`.
    async fn refund(
        &self,
        payment_intent_id: &str,
        amount: f64,
    ) -> Result<RefundReceipt, ServiceError>;
}

/// Gateway for desks without online payments; every refund attempt fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPaymentGateway;

#[async_trait]
impl PaymentGateway for NoPaymentGateway {
    async fn refund(
        &self,
        payment_intent_id: &str,
        _amount: f64,
    ) -> Result<RefundReceipt, ServiceError> {
        Err(ServiceError::Failed(format!(
            "no payment gateway configured to refund {payment_intent_id}"
        )))
    }
}

/// External auth provider holding portal logins.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Deletes the login with this stable user id.
    async fn delete_user(&self, uid: &str) -> Result<(), ServiceError>;

    /// Changes the login email of this user.
    async fn update_email(&self, uid: &str, email: &str) -> Result<(), ServiceError>;
}
