//! Meta-store key layout.
//!
//! All HFS state lives under one configurable prefix:
//!
//! - `/<prefix>/busproxy/business/<businessId>/tenant/0/node/<nodeId>`
//! - `/<prefix>/functions/business/<businessId>/tenant/<t>/function/<name>/version/<v>`
//! - `/<prefix>/instance/business/<businessId>/tenant/<t>/function/<name>/version/<v>/<az>/<requestId>/<instanceId>`
//! - `/<prefix>/route/business/<businessId>/<instanceId>`

use hfs_types::FunctionKey;

/// Key builder bound to one deployment prefix and business id.
#[derive(Debug, Clone)]
pub struct KeyLayout {
    prefix: String,
    business_id: String,
    az: String,
}

impl KeyLayout {
    pub fn new(
        prefix: impl Into<String>,
        business_id: impl Into<String>,
        az: impl Into<String>,
    ) -> Self {
        Self { prefix: prefix.into(), business_id: business_id.into(), az: az.into() }
    }

    pub fn bus_proxy_prefix(&self) -> String {
        format!("/{}/busproxy/business/{}/tenant/0/node/", self.prefix, self.business_id)
    }

    pub fn bus_proxy(&self, node_id: &str) -> String {
        format!("{}{}", self.bus_proxy_prefix(), node_id)
    }

    pub fn function_prefix(&self) -> String {
        format!("/{}/functions/business/{}/", self.prefix, self.business_id)
    }

    pub fn function(&self, key: &FunctionKey) -> String {
        format!(
            "{}tenant/{}/function/{}/version/{}",
            self.function_prefix(),
            key.tenant,
            key.name,
            key.version
        )
    }

    pub fn instance_prefix(&self) -> String {
        format!("/{}/instance/business/{}/", self.prefix, self.business_id)
    }

    pub fn instance(&self, function: &FunctionKey, request_id: &str, instance_id: &str) -> String {
        format!(
            "{}tenant/{}/function/{}/version/{}/{}/{}/{}",
            self.instance_prefix(),
            function.tenant,
            function.name,
            function.version,
            self.az,
            request_id,
            instance_id
        )
    }

    pub fn route_prefix(&self) -> String {
        format!("/{}/route/business/{}/", self.prefix, self.business_id)
    }

    pub fn route(&self, instance_id: &str) -> String {
        format!("{}{}", self.route_prefix(), instance_id)
    }

    /// Instance and route keys both end in the instance id.
    pub fn instance_id_of(key: &str) -> Option<&str> {
        key.rsplit('/').next().filter(|id| !id.is_empty())
    }

    /// Node id at the tail of a bus-proxy key.
    pub fn node_id_of(key: &str) -> Option<&str> {
        Self::instance_id_of(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> KeyLayout {
        KeyLayout::new("hfs", "biz1", "az0")
    }

    #[test]
    fn keys_are_deterministic() {
        let function = FunctionKey::new("t1", "echo", "v2");
        assert_eq!(
            layout().function(&function),
            "/hfs/functions/business/biz1/tenant/t1/function/echo/version/v2"
        );
        assert_eq!(
            layout().instance(&function, "req-9", "ins-3"),
            "/hfs/instance/business/biz1/tenant/t1/function/echo/version/v2/az0/req-9/ins-3"
        );
        assert_eq!(layout().route("ins-3"), "/hfs/route/business/biz1/ins-3");
        assert_eq!(layout().bus_proxy("node-7"), "/hfs/busproxy/business/biz1/tenant/0/node/node-7");
    }

    #[test]
    fn tail_extraction() {
        let function = FunctionKey::new("t1", "echo", "v2");
        let key = layout().instance(&function, "req-9", "ins-3");
        assert_eq!(KeyLayout::instance_id_of(&key), Some("ins-3"));
        assert_eq!(KeyLayout::node_id_of(&layout().bus_proxy("node-7")), Some("node-7"));
    }
}
