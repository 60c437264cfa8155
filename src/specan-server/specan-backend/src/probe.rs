// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Device availability probe for the `check_device` command.
//!
//! Enumerates without opening a stream, so it is safe to call while
//! another process (or this one) is receiving.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub available: bool,
    pub devices: Vec<String>,
    pub error: Option<String>,
}

#[cfg(feature = "soapysdr-sys")]
pub fn probe_devices() -> ProbeResult {
    match soapysdr::enumerate("") {
        Ok(found) => {
            let devices: Vec<String> = found.iter().map(|args| args.to_string()).collect();
            ProbeResult {
                available: !devices.is_empty(),
                devices,
                error: None,
            }
        }
        Err(e) => ProbeResult {
            available: false,
            devices: Vec::new(),
            error: Some(format!("SoapySDR enumeration failed: {}", e)),
        },
    }
}

#[cfg(not(feature = "soapysdr-sys"))]
pub fn probe_devices() -> ProbeResult {
    ProbeResult {
        available: true,
        devices: vec!["mock driver (built without soapysdr-sys)".to_string()],
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(feature = "soapysdr-sys"))]
    #[test]
    fn mock_build_reports_available() {
        let result = probe_devices();
        assert!(result.available);
        assert_eq!(result.devices.len(), 1);
        assert!(result.error.is_none());
    }
}
