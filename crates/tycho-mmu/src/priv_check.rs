//! Precomputed page-level privilege decision table.

/// Immutable 32-entry permission matrix, built once at construction so the
/// walker's permission decision is a single indexed load.
///
/// Index layout:
///
/// ```text
/// | 4  | 3  | 2  | 1  | 0 |
/// | wp | us | us | rw | rw|
///   |    |    |    |    +--> access is a write
///   |    |    +----+-------> combined page U/S and R/W (from the walk)
///   |    +-----------------> access comes from CPL 3
///   +----------------------> current CR0.WP
/// ```
///
/// Semantics are the 486+ rules: a supervisor with WP clear may do anything;
/// a user access needs U/S = 1 and, for writes, R/W = 1; with WP set,
/// supervisor writes additionally honor R/W.
#[derive(Debug, Clone)]
pub(crate) struct PrivCheckTable([bool; 32]);

impl PrivCheckTable {
    pub(crate) fn new() -> Self {
        let mut table = [false; 32];
        for (i, ok) in table.iter_mut().enumerate() {
            let wp = i & 0x10 != 0;
            let user_access = i & 0x08 != 0;
            let page_user = i & 0x04 != 0;
            let page_writable = i & 0x02 != 0;
            let write_access = i & 0x01 != 0;

            *ok = if wp {
                // Write protect on: U/S and R/W are enforced for everyone,
                // supervisor included.
                (!user_access || page_user) && (!write_access || page_writable)
            } else if !user_access {
                // Supervisor with WP off: anything goes.
                true
            } else {
                page_user && (!write_access || page_writable)
            };
        }
        Self(table)
    }

    #[inline]
    pub(crate) fn allows(&self, index: usize) -> bool {
        self.0[index]
    }
}
