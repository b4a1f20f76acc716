use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{AppConfig, ExchangeKind};
use crate::error::Result;

use super::{DeribitClient, ExchangeGateway, PaperExchange};

/// Create the runtime gateway from `AppConfig`.
///
/// Paper trading and dry runs simulate orders locally while reading
/// market data from Deribit. Only `kind = deribit` without dry run sends
/// real orders.
pub fn build_gateway(app_config: &AppConfig) -> Result<Arc<dyn ExchangeGateway>> {
    let exchange = &app_config.exchange;
    let deribit = DeribitClient::from_env(
        &exchange.base_url(),
        Duration::from_millis(exchange.request_timeout_ms),
    )?;

    match (exchange.kind, app_config.dry_run) {
        (ExchangeKind::Deribit, false) => {
            if !deribit.has_credentials() {
                warn!("DERIBIT_CLIENT_ID/DERIBIT_CLIENT_SECRET not set; private calls will fail");
            }
            info!(base_url = %exchange.base_url(), "using live Deribit gateway");
            Ok(Arc::new(deribit))
        }
        (kind, _) => {
            let paper = PaperExchange::new().with_market_data(Arc::new(deribit));
            for (currency, equity) in &exchange.paper_equity {
                paper.set_equity(currency, *equity);
            }
            info!(?kind, dry_run = app_config.dry_run, "using paper gateway over Deribit market data");
            Ok(Arc::new(paper))
        }
    }
}
