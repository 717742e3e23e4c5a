// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tpmreg Authors

pub mod agent_identity;
pub mod api_version;
pub mod bootstrap;
pub mod config;
pub mod crypto;
pub mod json_wrapper;
pub mod registrar_client;
pub mod resilient_client;
pub mod serialization;
pub mod structures;
pub mod tls;
