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

//! PostgreSQL dialect library. Arrays are native, records travel as `jsonb`.

use super::{BuiltinDef, Library, LibraryProfile};

pub(super) fn library(profile: LibraryProfile) -> Library {
    let mut builtins = vec![
        BuiltinDef::new("ArgMin", 2, "(ARRAY_AGG({0} ORDER BY {1} ASC))[1]"),
        BuiltinDef::new("ArgMax", 2, "(ARRAY_AGG({0} ORDER BY {1} DESC))[1]"),
        BuiltinDef::new("ArgMinK", 3, "(ARRAY_AGG({0} ORDER BY {1} ASC))[1:{2}]"),
        BuiltinDef::new("ArgMaxK", 3, "(ARRAY_AGG({0} ORDER BY {1} DESC))[1:{2}]"),
        BuiltinDef::new("ArrayAgg", 1, "ARRAY_AGG({0})"),
        BuiltinDef::new("Pair", 2, "jsonb_build_array({0}, {1})"),
        // 60 bits of md5, reinterpreted as a bigint.
        BuiltinDef::new(
            "Fingerprint",
            1,
            "('x' || substr(md5(({0})::text), 1, 15))::bit(60)::bigint",
        ),
        BuiltinDef::new("AssembleRecord", 2, "jsonb_object_agg({0}, {1})"),
        BuiltinDef::new(
            "DisassembleRecord",
            1,
            "(SELECT key, value FROM jsonb_each({0}))",
        ),
        BuiltinDef::new("In", 2, "{0} = ANY({1})"),
    ];
    if profile == LibraryProfile::Full {
        builtins.extend([
            BuiltinDef::new("ReadFile", 1, "pg_read_file({0})"),
            BuiltinDef::new("WriteFile", 2, "lo_export({1}, {0})"),
        ]);
    }
    Library::from_builtins(builtins)
}
