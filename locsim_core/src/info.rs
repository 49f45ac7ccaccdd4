use locsim_common::device::ProductVersion;

use crate::{error::InfoError, trust::ControlClient};

const PRODUCT_VERSION: &str = "ProductVersion";
const PRODUCT_NAME: &str = "ProductName";
const DEVICE_NAME: &str = "DeviceName";

fn string_value(client: &ControlClient, key: &'static str) -> Result<String, InfoError> {
    match client.get_value(None, key) {
        Ok(Some(value)) => value
            .as_str()
            .map(str::to_owned)
            .ok_or(InfoError::ValueUnavailable(key)),
        Ok(None) => Err(InfoError::ValueUnavailable(key)),
        Err(e) => {
            tracing::debug!("Reading {} from {} failed: {}", key, client.udid(), e);
            Err(InfoError::ValueUnavailable(key))
        }
    }
}

/// Full version string as reported, e.g. `14.2.1`.
pub fn raw_product_version(client: &ControlClient) -> Result<String, InfoError> {
    string_value(client, PRODUCT_VERSION)
}

pub fn product_version(client: &ControlClient) -> Result<ProductVersion, InfoError> {
    let raw = raw_product_version(client)?;
    ProductVersion::parse(&raw).ok_or(InfoError::ValueUnavailable(PRODUCT_VERSION))
}

pub fn device_name(client: &ControlClient) -> Result<String, InfoError> {
    string_value(client, DEVICE_NAME)
}

/// OS product name, e.g. `iPhone OS`.
pub fn product_name(client: &ControlClient) -> Result<String, InfoError> {
    string_value(client, PRODUCT_NAME)
}
