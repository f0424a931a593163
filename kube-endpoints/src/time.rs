// kube-endpoints - health-checked service endpoints for Kubernetes
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

//
// TimeProvider
//

pub trait TimeProvider: Send + Sync + 'static {
  fn now_utc(&self) -> OffsetDateTime;

  /// The current time as used in condition timestamps, with second precision.
  fn now_rfc3339(&self) -> String {
    let now = self.now_utc();
    now
      .replace_nanosecond(0)
      .unwrap_or(now)
      .format(&Rfc3339)
      .unwrap_or_default()
  }
}

//
// RealTimeProvider
//

pub struct RealTimeProvider {}

impl TimeProvider for RealTimeProvider {
  fn now_utc(&self) -> OffsetDateTime {
    OffsetDateTime::now_utc()
  }
}

//
// TestTimeProvider
//

#[derive(Default)]
pub struct TestTimeProvider {
  pub time: Arc<AtomicI64>,
}

impl TestTimeProvider {
  pub fn advance(&self, seconds: i64) {
    self.time.fetch_add(seconds, Ordering::SeqCst);
  }
}

impl TimeProvider for TestTimeProvider {
  fn now_utc(&self) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(self.time.load(Ordering::SeqCst))
      .unwrap_or(OffsetDateTime::UNIX_EPOCH)
  }
}
