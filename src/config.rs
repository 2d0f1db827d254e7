use std::{env, fmt};

pub const DEFAULT_REGION: &str = "cn-east-3";
pub const DEFAULT_STORAGE_CLASS: &str = "STANDARD";

/// Puts small objects in a different storage class than the default.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SmallObjectPolicy {
    /// Objects strictly smaller than this many bytes qualify.
    pub threshold: u64,
    pub storage_class: String,
    /// Also replace a storage class the caller asked for explicitly.
    pub override_explicit: bool,
}

#[derive(Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    pub endpoint: String,
    pub storage_class: String,
    pub acl: Option<String>,
    pub path_style: bool,
    pub small_object: Option<SmallObjectPolicy>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            access_key: String::new(),
            secret_key: String::new(),
            region: DEFAULT_REGION.to_string(),
            endpoint: default_endpoint(DEFAULT_REGION),
            storage_class: DEFAULT_STORAGE_CLASS.to_string(),
            acl: None,
            path_style: false,
            small_object: None,
        }
    }
}

pub fn default_endpoint(region: &str) -> String {
    format!("https://obs.{}.myhuaweicloud.com", region)
}

impl BackendConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Unset and empty values fall
    /// back to the defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.is_empty());

        let region = get("HUAWEI_REGION").unwrap_or_else(|| DEFAULT_REGION.to_string());
        let endpoint = get("HUAWEI_OBS_ENDPOINT").unwrap_or_else(|| default_endpoint(&region));

        Self {
            access_key: get("HUAWEI_ACCESS_KEY_ID").unwrap_or_default(),
            secret_key: get("HUAWEI_SECRET_ACCESS_KEY").unwrap_or_default(),
            endpoint,
            region,
            storage_class: get("HUAWEI_STORAGE_CLASS")
                .unwrap_or_else(|| DEFAULT_STORAGE_CLASS.to_string()),
            acl: get("HUAWEI_OBS_ACL"),
            path_style: get("HUAWEI_OBS_PATH_STYLE")
                .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            small_object: None,
        }
    }

    pub fn has_static_credentials(&self) -> bool {
        !self.access_key.is_empty() && !self.secret_key.is_empty()
    }

    /// Storage class for a new object of `size` bytes.
    pub fn storage_class_for(&self, size: Option<u64>, explicit: Option<&str>) -> String {
        let chosen = explicit.unwrap_or(&self.storage_class).to_string();

        let policy = match &self.small_object {
            Some(policy) => policy,
            None => return chosen,
        };

        let small = size.is_some_and(|size| size < policy.threshold);
        let allowed = explicit.is_none() || policy.override_explicit;
        if small && allowed && self.storage_class == DEFAULT_STORAGE_CLASS {
            policy.storage_class.clone()
        } else {
            chosen
        }
    }
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConfig")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("storage_class", &self.storage_class)
            .field("acl", &self.acl)
            .field("path_style", &self.path_style)
            .field("small_object", &self.small_object)
            .finish()
    }
}
