/*
 * Copyright Logica Contributors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *      https://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! SQLite dialect library. Arrays and records are carried as JSON1 values,
//! so the aggregate builtins lean on `json_array` / `json_group_*` and the
//! `json_each` virtual table.

use super::{BuiltinDef, Library, LibraryProfile};

pub(super) fn library(profile: LibraryProfile) -> Library {
    let mut builtins = vec![
        // ArgMin/ArgMax pack (key, value) pairs into a JSON array so that
        // MIN/MAX order by the key, then unpack the value.
        BuiltinDef::new(
            "ArgMin",
            2,
            "json_extract(MIN(json_array({1}, {0})), '$[1]')",
        ),
        BuiltinDef::new(
            "ArgMax",
            2,
            "json_extract(MAX(json_array({1}, {0})), '$[1]')",
        ),
        BuiltinDef::new(
            "ArgMinK",
            3,
            "(SELECT json_group_array(json_extract(value, '$[1]')) FROM (SELECT value FROM json_each(json_group_array(json_array({1}, {0}))) ORDER BY json_extract(value, '$[0]') ASC LIMIT {2}))",
        ),
        BuiltinDef::new(
            "ArgMaxK",
            3,
            "(SELECT json_group_array(json_extract(value, '$[1]')) FROM (SELECT value FROM json_each(json_group_array(json_array({1}, {0}))) ORDER BY json_extract(value, '$[0]') DESC LIMIT {2}))",
        ),
        BuiltinDef::new("ArrayAgg", 1, "json_group_array({0})"),
        BuiltinDef::new("Pair", 2, "json_array({0}, {1})"),
        // SQLite ships no hash function; a hex prefix of the raw bytes is the
        // portable stand-in for a 60-bit fingerprint.
        BuiltinDef::new(
            "Fingerprint",
            1,
            "CAST(('0x' || substr(hex(CAST({0} AS BLOB)), 1, 15)) AS INTEGER)",
        ),
        BuiltinDef::new("AssembleRecord", 2, "json_group_object({0}, {1})"),
        BuiltinDef::new(
            "DisassembleRecord",
            1,
            "(SELECT key, value FROM json_each({0}))",
        ),
        BuiltinDef::new("In", 2, "{0} IN (SELECT value FROM json_each({1}))"),
    ];
    if profile == LibraryProfile::Full {
        builtins.extend([
            BuiltinDef::new("ReadFile", 1, "readfile({0})"),
            BuiltinDef::new("WriteFile", 2, "writefile({0}, {1})"),
        ]);
    }
    Library::from_builtins(builtins)
}
