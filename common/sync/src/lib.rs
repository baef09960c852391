// Copyright 2025 The fragwatch Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Sync primitive types whose methods panic rather than returning error in case of poison.
//!
//! The `Mutex` here wraps the standard library version and mirrors its methods, except that it
//! panics where the standard library would return a `PoisonError`. Release builds of fragwatch
//! use panic=abort, so poisoning never occurs and callers should not have to consider it; in
//! tests a poisoned lock means the test already failed.

mod mutex;

pub use crate::mutex::Mutex;
