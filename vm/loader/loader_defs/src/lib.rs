// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Type definitions for booting a 32-bit x86 guest kernel.

#![warn(missing_docs)]
#![no_std]

pub mod linux;
