// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Process-wide `actix_web::web::Data` handed to every handler: the shared
//! core services (§4) plus the configuration they were built from.

use std::sync::Arc;

use vaultsync_core::config::Settings;
use vaultsync_core::connection::Core;
use vaultsync_core::crypto::KeyAgreement;
use vaultsync_core::store::StoreAdapter;

pub struct AppState<S: StoreAdapter, K: KeyAgreement> {
    pub core: Arc<Core<S, K>>,
    pub settings: Settings,
}
