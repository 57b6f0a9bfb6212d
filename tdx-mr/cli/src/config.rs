// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use fs_err as fs;
use serde::Deserialize;
use tdx_mr::{resolve_key_provider, ConfigurationTable, PageAddOrder, DEFAULT_KEY_PROVIDER};
use tracing::debug;

const DEFAULT_CONFIG: &str = include_str!("../tdx-mr.toml");

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MemorySize {
    Bytes(u64),
    Text(String),
}

impl MemorySize {
    pub fn bytes(&self) -> Result<u64> {
        match self {
            MemorySize::Bytes(bytes) => Ok(*bytes),
            MemorySize::Text(text) => parse_memory_size(text),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CliConfig {
    pub cpu: u32,
    pub memory: MemorySize,
    #[serde(default)]
    pub mrtd_variant: PageAddOrder,
    #[serde(default)]
    pub key_provider: Option<String>,
    #[serde(default)]
    pub configuration: Option<String>,
    #[serde(default)]
    pub configurations: ConfigurationTable,
}

impl CliConfig {
    /// Embedded defaults, then `path`, then `TDX_MR_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new().merge(Toml::string(DEFAULT_CONFIG));
        if let Some(path) = path {
            let content = fs::read_to_string(path).context("Failed to read configuration file")?;
            figment = figment.merge(Toml::string(&content));
        }
        let config: CliConfig = figment
            .merge(Env::prefixed("TDX_MR_"))
            .extract()
            .context("Failed to load configuration")?;
        for name in config.configurations.names() {
            config
                .configurations
                .get(name)
                .context("Invalid machine configuration")?;
        }
        debug!(
            "loaded {} machine configurations",
            config.configurations.names().count()
        );
        Ok(config)
    }

    /// Resolves the key provider, preferring `overridden` over the file.
    pub fn key_provider(&self, overridden: Option<&str>) -> Result<[u8; 32]> {
        match overridden.or(self.key_provider.as_deref()) {
            Some(value) => resolve_key_provider(value).context("Failed to resolve key provider"),
            None => Ok(DEFAULT_KEY_PROVIDER),
        }
    }
}

/// Parses `<n>G`, `<n>M`, `0x<hex>` or a plain byte count.
pub fn parse_memory_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let (digits, shift) = match s.as_bytes().last() {
        Some(b'G' | b'g') => (&s[..s.len() - 1], 30),
        Some(b'M' | b'm') => (&s[..s.len() - 1], 20),
        _ => (s, 0),
    };
    let value = match digits.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => digits.parse(),
    }
    .with_context(|| format!("Invalid memory size: {s:?}"))?;
    value
        .checked_mul(1 << shift)
        .with_context(|| format!("Memory size overflows: {s:?}"))
}
