/*
 * Copyright (C) 2024 The Stratum Operator Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::stratum::k8s::store::StoreError;
use crate::stratum::util::error::with_context;

use std::error::Error;
use std::fmt;

/// Errors raised by a reconciliation cycle.
///
/// `Requeue` is not a failure: it asks the outer scheduler for a prompt
/// re-check, used deliberately after creating an object whose status cannot
/// be observed yet, or when a health-gated decision needs fresher data.
#[derive(Debug)]
pub enum SyncError {
    Requeue(String),
    Store(StoreError),
    Dependency(String),
    Internal(Box<dyn Error + Send + Sync>),
}

impl SyncError {
    pub fn is_requeue(&self) -> bool {
        matches!(self, SyncError::Requeue(_))
    }

    /// Prepends context to the error. Requeue signals pass through
    /// untouched so the scheduler still recognizes them.
    pub fn wrap(self, context: impl Into<String>) -> Self {
        match self {
            SyncError::Requeue(message) => SyncError::Requeue(message),
            SyncError::Store(err) => SyncError::Internal(with_context(err, context)),
            SyncError::Dependency(message) => {
                SyncError::Internal(with_context(crate::stratum::util::error::new_error(message), context))
            }
            SyncError::Internal(err) => SyncError::Internal(with_context(err, context)),
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Requeue(message) => write!(f, "requeue: {}", message),
            SyncError::Store(err) => write!(f, "{}", err),
            SyncError::Dependency(message) => write!(f, "dependency error: {}", message),
            SyncError::Internal(err) => write!(f, "{}", err),
        }
    }
}

impl Error for SyncError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SyncError::Store(err) => Some(err),
            SyncError::Internal(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        SyncError::Store(err)
    }
}
