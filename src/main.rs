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

use stratum_operator::stratum::controller::hooks::{
    AnnotationSuspender, PassthroughScaler, StatusFailover,
};
use stratum_operator::stratum::controller::runtime::OperatorRuntime;
use stratum_operator::stratum::controller::upgrade::GatedUpgrader;
use stratum_operator::stratum::controller::PlacementMemberManager;
use stratum_operator::stratum::k8s::store::{KeyspaceStore, ObjectStore};
use stratum_operator::stratum::logger::{log_info, set_log_format, LogFormat};
use stratum_operator::stratum::placement::client::HttpPlacementControl;
use stratum_operator::stratum::{config, Config};

use std::sync::Arc;

const COMPONENT: &str = "main";

#[tokio::main]
async fn main() {
    if std::env::var("STRATUM_LOG_FORMAT").as_deref() == Ok("json") {
        set_log_format(LogFormat::Json);
    }

    let store: Arc<dyn ObjectStore> = Arc::new(KeyspaceStore::new());
    let manager = Arc::new(PlacementMemberManager::new(
        store.clone(),
        Arc::new(HttpPlacementControl::new()),
        Arc::new(PassthroughScaler),
        Arc::new(GatedUpgrader::new(store)),
        Arc::new(StatusFailover),
        Arc::new(AnnotationSuspender),
    ));

    let runtime = OperatorRuntime::new(manager);
    let worker = runtime.spawn_worker();
    let resync = runtime.spawn_resync(config::resync_interval());

    log_info(
        COMPONENT,
        "stratum operator started",
        &[(
            "keyspace",
            Config::Keyspace.get_path().display().to_string().as_str(),
        )],
    );

    if let Err(err) = tokio::signal::ctrl_c().await {
        log_info(COMPONENT, "signal wait failed; shutting down", &[(
            "error",
            err.to_string().as_str(),
        )]);
    }
    log_info(COMPONENT, "shutting down", &[]);
    worker.abort();
    resync.abort();
}
