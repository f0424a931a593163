// kube-endpoints - health-checked service endpoints for Kubernetes
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

pub mod bind_resolver;
pub mod k8s;

use bd_log::SwapLogger;
use bd_panic::PanicType;

#[cfg(test)]
#[ctor::ctor]
fn test_global_init() {
  global_initialize();
}

pub fn global_initialize() {
  // The panic handler has to be in place before the logger so that a log line emitted with thread
  // ids during ctor does not panic.
  bd_panic::default(PanicType::ForceAbort);

  SwapLogger::initialize();

  // Both the kube client and the HTTPS prober use rustls. A second install (tests initialize once
  // per binary) is harmless.
  let _ignored = rustls::crypto::aws_lc_rs::default_provider().install_default();

  #[cfg(not(debug_assertions))]
  unsafe {
    std::env::set_var("LOG_PANIC", "true");
  }
}
