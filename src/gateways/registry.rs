use crate::gateways::adapters::{CashfreeGateway, RazorpayGateway, CASHFREE, RAZORPAY};
use crate::gateways::client::GatewayClient;
use crate::gateways::types::GatewayName;
use std::sync::Arc;
use tracing::{info, warn};

/// Priority-ordered set of usable gateway clients.
///
/// Built once at startup from whatever adapters have working credentials;
/// entries that fail to build are logged and left out, so an outage of one
/// provider's configuration never takes the service down.
pub struct GatewayRegistry {
    gateways: Vec<Arc<dyn GatewayClient>>,
}

impl GatewayRegistry {
    /// Build the registry from `PAYMENT_GATEWAY_PRIORITY` and per-adapter
    /// credentials.
    pub fn from_env() -> Self {
        let raw = std::env::var("PAYMENT_GATEWAY_PRIORITY")
            .unwrap_or_else(|_| format!("{},{}", RAZORPAY, CASHFREE));
        let priority = parse_priority(&raw);

        let mut gateways: Vec<Arc<dyn GatewayClient>> = Vec::new();
        for name in &priority {
            match name.as_str() {
                RAZORPAY => {
                    if !env_enabled("RAZORPAY_ENABLED") {
                        info!(gateway = RAZORPAY, "gateway disabled by configuration");
                        continue;
                    }
                    match RazorpayGateway::from_env() {
                        Ok(gateway) => gateways.push(Arc::new(gateway)),
                        Err(e) => warn!(gateway = RAZORPAY, error = %e, "skipping gateway"),
                    }
                }
                CASHFREE => {
                    if !env_enabled("CASHFREE_ENABLED") {
                        info!(gateway = CASHFREE, "gateway disabled by configuration");
                        continue;
                    }
                    match CashfreeGateway::from_env() {
                        Ok(gateway) => gateways.push(Arc::new(gateway)),
                        Err(e) => warn!(gateway = CASHFREE, error = %e, "skipping gateway"),
                    }
                }
                other => warn!(gateway = other, "unknown gateway in priority list, skipping"),
            }
        }

        info!(
            usable = gateways.len(),
            priority = %raw,
            "gateway registry built"
        );
        Self { gateways }
    }

    /// Construct a registry from pre-built clients, in priority order.
    pub fn with_clients(gateways: Vec<Arc<dyn GatewayClient>>) -> Self {
        Self { gateways }
    }

    /// Look up a gateway by name. Webhook intake uses this; a miss means the
    /// path segment names a gateway this deployment does not know.
    pub fn get(&self, name: &GatewayName) -> Option<Arc<dyn GatewayClient>> {
        self.gateways.iter().find(|g| &g.name() == name).cloned()
    }

    /// Failover candidates for order creation: the preferred gateway first
    /// when it is usable, then the remaining gateways in priority order.
    pub fn candidates(&self, preferred: Option<&GatewayName>) -> Vec<Arc<dyn GatewayClient>> {
        let mut ordered: Vec<Arc<dyn GatewayClient>> = Vec::with_capacity(self.gateways.len());

        if let Some(name) = preferred {
            match self.get(name) {
                Some(gateway) => ordered.push(gateway),
                None => warn!(gateway = %name, "preferred gateway not usable, falling through priority list"),
            }
        }
        for gateway in &self.gateways {
            if ordered.iter().all(|g| g.name() != gateway.name()) {
                ordered.push(gateway.clone());
            }
        }
        ordered
    }

    pub fn list_usable(&self) -> Vec<GatewayName> {
        self.gateways.iter().map(|g| g.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.gateways.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gateways.is_empty()
    }
}

fn parse_priority(raw: &str) -> Vec<GatewayName> {
    let mut priority = Vec::new();
    for part in raw.split(',') {
        let value = part.trim();
        if value.is_empty() {
            continue;
        }
        let name = GatewayName::new(value);
        if !priority.contains(&name) {
            priority.push(name);
        }
    }
    priority
}

fn env_enabled(var: &str) -> bool {
    std::env::var(var)
        .ok()
        .and_then(|v| v.trim().parse::<bool>().ok())
        .unwrap_or(true)
}
