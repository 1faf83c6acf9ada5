// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared utilities: attention masks and tensor extraction helpers.

pub mod masks;
pub mod tensor;
