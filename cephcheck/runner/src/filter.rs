// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// Selects checks by substrings of their names.
pub struct CheckFilter<'a> {
    pub must_include: &'a [String],
    pub must_exclude: &'a [String],
}

impl CheckFilter<'_> {
    /// Whether the check called `name` runs: it must contain every include
    /// pattern and none of the exclude patterns. An empty include list
    /// admits every name.
    pub fn check(&self, name: &str) -> bool {
        self.must_include.iter().all(|inc| name.contains(inc))
            && self.must_exclude.iter().all(|exc| !name.contains(exc))
    }
}
