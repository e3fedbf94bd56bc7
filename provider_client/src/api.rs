use std::sync::Arc;

use async_trait::async_trait;
use log::*;
use paygate_common::MinorUnits;
use paygate_engine::{
    db_types::InvoiceId,
    traits::{FreshToken, InvoiceRequest, NewInvoice, PaymentCheck, PaymentProvider, ProviderError},
};
use reqwest::{header::HeaderValue, Client, Method};
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    config::ProviderConfig,
    data_objects::{AuthRequest, AuthResponse, CreateInvoiceRequest, InvoiceResponse, PaymentStatusResponse},
};

#[derive(Clone)]
pub struct ProviderApi {
    config: ProviderConfig,
    client: Arc<Client>,
}

impl ProviderApi {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let mut headers = reqwest::header::HeaderMap::with_capacity(1);
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::Initialization(e.to_string()))?;
        Ok(Self { config, client: Arc::new(client) })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url)
    }

    async fn rest_query<T: DeserializeOwned, B: Serialize>(
        &self,
        method: Method,
        path: &str,
        bearer: Option<&str>,
        body: Option<B>,
    ) -> Result<T, ProviderError> {
        let url = self.url(path);
        trace!("Sending provider query: {url}");
        let mut req = self.client.request(method, url);
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }
        if let Some(body) = body {
            req = req.json(&body);
        }
        let response = req.send().await.map_err(|e| ProviderError::ResponseError(e.to_string()))?;
        if response.status().is_success() {
            trace!("Provider query successful. {}", response.status());
            response.json::<T>().await.map_err(|e| ProviderError::JsonError(e.to_string()))
        } else {
            let status = response.status().as_u16();
            let message = response.text().await.map_err(|e| ProviderError::ResponseError(e.to_string()))?;
            Err(ProviderError::QueryError { status, message })
        }
    }
}

#[async_trait]
impl PaymentProvider for ProviderApi {
    async fn authenticate(&self) -> Result<FreshToken, ProviderError> {
        let body = AuthRequest {
            api_key: self.config.api_key.reveal().as_str(),
            api_secret: self.config.api_secret.reveal().as_str(),
        };
        debug!("Requesting fresh provider token");
        let response = self
            .rest_query::<AuthResponse, AuthRequest>(Method::POST, "/api/auth/token", None, Some(body))
            .await
            .map_err(|e| match e {
                ProviderError::QueryError { status, message } if status == 401 || status == 403 => {
                    ProviderError::Authentication(format!("Error {status}. {message}"))
                },
                e => e,
            })?;
        info!("Provider token issued");
        Ok(FreshToken { access_token: response.access_token, expires: response.expires })
    }

    async fn create_invoice(&self, token: &str, request: &InvoiceRequest) -> Result<NewInvoice, ProviderError> {
        let body = CreateInvoiceRequest {
            amount: request.amount,
            currency: request.currency.clone(),
            callback_url: request.callback_url.clone(),
            reference: request.reference.clone(),
        };
        debug!("Creating invoice for reference {}", request.reference);
        let response = self
            .rest_query::<InvoiceResponse, CreateInvoiceRequest>(Method::POST, "/api/invoices", Some(token), Some(body))
            .await?;
        info!("Invoice {} created for reference {}", response.invoice_id, request.reference);
        Ok(NewInvoice { invoice_id: InvoiceId(response.invoice_id), payment_url: response.payment_url })
    }

    async fn check_payment(&self, token: &str, invoice_id: &InvoiceId) -> Result<PaymentCheck, ProviderError> {
        let path = format!("/api/invoices/{invoice_id}/status");
        debug!("Checking payment status of invoice {invoice_id}");
        let response =
            self.rest_query::<PaymentStatusResponse, ()>(Method::GET, &path, Some(token), None).await?;
        Ok(PaymentCheck {
            paid: response.paid,
            paid_amount: MinorUnits::from(response.paid_amount),
            payment_id: response.payment_id,
            raw_statuses: response.statuses,
        })
    }
}
