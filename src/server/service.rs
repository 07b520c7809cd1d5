use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::error;

use crate::pb::exchange_rate_service_server::ExchangeRateService;
use crate::pb::{Decimal, GetRatesRequest, GetRatesResponse, HealthCheckRequest, HealthCheckResponse};
use crate::rates::{ExchangeRate, RateProvider};

pub const INVALID_MARKET_MESSAGE: &str = "Invalid marketID";
pub const INTERNAL_MESSAGE: &str = "failed to fetch rates";

/// gRPC face of the rate pipeline.
pub struct RateService<P> {
    provider: Arc<P>,
}

impl<P: RateProvider> RateService<P> {
    pub fn new(provider: Arc<P>) -> Self {
        Self { provider }
    }
}

fn validate_get_rates(req: &GetRatesRequest) -> Result<(), Status> {
    if req.market.is_empty() {
        return Err(Status::invalid_argument("market is required"));
    }
    Ok(())
}

fn to_response(rate: &ExchangeRate) -> GetRatesResponse {
    GetRatesResponse {
        ts: rate.ts,
        ask_price: Some(Decimal { value: rate.ask_price.to_string() }),
        bid_price: Some(Decimal { value: rate.bid_price.to_string() }),
    }
}

#[tonic::async_trait]
impl<P: RateProvider> ExchangeRateService for RateService<P> {
    async fn get_rates(&self, request: Request<GetRatesRequest>) -> Result<Response<GetRatesResponse>, Status> {
        let req = request.into_inner();
        validate_get_rates(&req)?;

        // A client deadline or a halt drops this future, and with it the
        // upstream request or the pending insert.
        let rate = self.provider.get_exchange_rate(&req.market).await.map_err(|e| {
            if e.is_invalid_market() {
                Status::invalid_argument(INVALID_MARKET_MESSAGE)
            } else {
                error!(market = %req.market, error = %e, "GetRates failed");
                Status::internal(INTERNAL_MESSAGE)
            }
        })?;

        Ok(Response::new(to_response(&rate)))
    }

    async fn health_check(&self, _request: Request<HealthCheckRequest>) -> Result<Response<HealthCheckResponse>, Status> {
        Ok(Response::new(HealthCheckResponse { status: "OK".to_string() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal as Dec;
    use std::str::FromStr;

    #[test]
    fn test_empty_market_rejected() {
        let status = validate_get_rates(&GetRatesRequest { market: String::new() }).unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(validate_get_rates(&GetRatesRequest { market: "btc_rub".to_string() }).is_ok());
    }

    #[test]
    fn test_response_keeps_decimal_text() {
        let rate = ExchangeRate {
            id: 9,
            ask_price: Dec::from_str("95.50").unwrap(),
            bid_price: Dec::ZERO,
            ts: 1_700_000_000,
        };

        let resp = to_response(&rate);
        assert_eq!(resp.ts, 1_700_000_000);
        assert_eq!(resp.ask_price.unwrap().value, "95.50");
        assert_eq!(resp.bid_price.unwrap().value, "0");
    }
}
