// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Methods to construct page tables.

#![forbid(unsafe_code)]

pub mod x86;
