//! In-memory stand-ins for the provider and the order service.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use paygate_common::MinorUnits;
use serde_json::Value;

use crate::{
    db_types::InvoiceId,
    traits::{
        FreshToken,
        InvoiceRequest,
        NewInvoice,
        OrderCreationError,
        OrderCreator,
        PaymentCheck,
        PaymentProvider,
        ProviderError,
    },
};

#[derive(Default)]
struct MockProviderState {
    next_invoice: u64,
    checks: HashMap<String, PaymentCheck>,
    fail_checks: bool,
    auth_calls: usize,
    check_calls: usize,
}

/// A scriptable payment provider. Invoices are minted sequentially; payment checks answer from
/// a table populated by the test.
#[derive(Clone, Default)]
pub struct MockProvider {
    state: Arc<Mutex<MockProviderState>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the provider to report `invoice` as paid at `amount`.
    pub fn set_paid(&self, invoice: &InvoiceId, amount: MinorUnits) {
        let check = PaymentCheck {
            paid: true,
            paid_amount: amount,
            payment_id: Some(format!("pay-{invoice}")),
            raw_statuses: vec!["PAID".to_string()],
        };
        self.state.lock().unwrap().checks.insert(invoice.to_string(), check);
    }

    pub fn set_unpaid(&self, invoice: &InvoiceId) {
        self.state.lock().unwrap().checks.remove(invoice.as_str());
    }

    /// When set, every payment check fails as if the provider were down.
    pub fn fail_checks(&self, fail: bool) {
        self.state.lock().unwrap().fail_checks = fail;
    }

    pub fn auth_calls(&self) -> usize {
        self.state.lock().unwrap().auth_calls
    }

    pub fn check_calls(&self) -> usize {
        self.state.lock().unwrap().check_calls
    }
}

#[async_trait]
impl PaymentProvider for MockProvider {
    async fn authenticate(&self) -> Result<FreshToken, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.auth_calls += 1;
        Ok(FreshToken { access_token: format!("test-token-{}", state.auth_calls), expires: 3600 })
    }

    async fn create_invoice(&self, _token: &str, _request: &InvoiceRequest) -> Result<NewInvoice, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.next_invoice += 1;
        let invoice_id = InvoiceId(format!("inv-{}", state.next_invoice));
        let payment_url = format!("https://pay.test/{invoice_id}");
        Ok(NewInvoice { invoice_id, payment_url })
    }

    async fn check_payment(&self, _token: &str, invoice_id: &InvoiceId) -> Result<PaymentCheck, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.check_calls += 1;
        if state.fail_checks {
            return Err(ProviderError::QueryError { status: 503, message: "provider offline".to_string() });
        }
        let check = state.checks.get(invoice_id.as_str()).cloned().unwrap_or(PaymentCheck {
            paid: false,
            paid_amount: MinorUnits::from(0),
            payment_id: None,
            raw_statuses: vec!["OPEN".to_string()],
        });
        Ok(check)
    }
}

#[derive(Default)]
struct MockOrderCreatorState {
    next_order: u64,
    fail: bool,
    calls: usize,
    created: Vec<String>,
}

/// An order service that mints sequential order ids and can be told to fail.
#[derive(Clone, Default)]
pub struct MockOrderCreator {
    state: Arc<Mutex<MockOrderCreatorState>>,
}

impl MockOrderCreator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `create_orders` call fail. The flag clears itself after firing.
    pub fn fail_next(&self, fail: bool) {
        self.state.lock().unwrap().fail = fail;
    }

    pub fn calls(&self) -> usize {
        self.state.lock().unwrap().calls
    }

    /// Every order id this creator has ever handed out, in order.
    pub fn created(&self) -> Vec<String> {
        self.state.lock().unwrap().created.clone()
    }
}

#[async_trait]
impl OrderCreator for MockOrderCreator {
    async fn create_orders(&self, _cart_payload: &Value, user_id: &str) -> Result<Vec<String>, OrderCreationError> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        if state.fail {
            state.fail = false;
            return Err(OrderCreationError::Failed(format!("order service rejected cart for {user_id}")));
        }
        state.next_order += 1;
        let id = format!("ord-{}", state.next_order);
        state.created.push(id.clone());
        Ok(vec![id])
    }
}
