/*
 * Copyright 2020 Nikhil Marathe <nsm.nikhil@gmail.com>
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use proptest::prelude::*;

use super::{
    interface::Rebuilder,
    rebuilder::{Decision, MTimeRebuilder, Reason},
    state::BuildState,
};
use pbx_interface::testing::MemoryFilesystem;
use pbx_invocation::{Executable, Invocation};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy)]
enum Stamp {
    DoesNotExist,
    Modified(SystemTime),
}

fn stamp_strategy() -> impl Strategy<Value = Stamp> {
    prop_oneof![
        1 => Just(Stamp::DoesNotExist),
        4 => (0u64..1_000).prop_map(|s| Stamp::Modified(UNIX_EPOCH + Duration::from_secs(s))),
    ]
}

fn place(fs: &MemoryFilesystem, path: &str, stamp: Stamp) {
    if let Stamp::Modified(time) = stamp {
        fs.add_file(path, "");
        fs.set_modified(path, time).expect("just added");
    }
}

fn compile() -> Invocation {
    Invocation::new()
        .with_executable(Executable::determine("cc"))
        .with_arguments(vec!["-c", "foo.c"])
        .with_working_directory("/w")
        .with_inputs(vec!["foo.c"])
        .with_outputs(vec!["foo.o"])
}

proptest! {
    #[test]
    fn rebuilder_follows_timestamps(input in stamp_strategy(), output in stamp_strategy()) {
        let fs = MemoryFilesystem::new();
        place(&fs, "/w/foo.c", input);
        place(&fs, "/w/foo.o", output);
        let state = BuildState::new();
        let decision = MTimeRebuilder::new(&fs, &state, "/").decide(&compile(), None);
        match (input, output) {
            (_, Stamp::DoesNotExist) => {
                prop_assert_eq!(decision, Decision::Build(Reason::MissingOutput("foo.o".to_owned())));
            }
            (Stamp::DoesNotExist, _) => {
                prop_assert_eq!(decision, Decision::Build(Reason::MissingInput("foo.c".to_owned())));
            }
            (Stamp::Modified(a), Stamp::Modified(b)) => {
                if a > b {
                    prop_assert_eq!(decision, Decision::Build(Reason::InputNewer("foo.c".to_owned())));
                } else {
                    prop_assert_eq!(decision, Decision::Skip, "if input is not newer, no rebuild expected");
                }
            }
        }
    }

    #[test]
    fn phony_and_order_inputs_never_force_builds(
        phony in stamp_strategy(),
        order in stamp_strategy(),
    ) {
        let fs = MemoryFilesystem::new();
        place(&fs, "/w/foo.o", Stamp::Modified(UNIX_EPOCH + Duration::from_secs(500)));
        place(&fs, "/w/foo.c", Stamp::Modified(UNIX_EPOCH + Duration::from_secs(100)));
        place(&fs, "/w/phony", phony);
        place(&fs, "/w/stamp", order);
        let invocation = compile()
            .with_phony_inputs(vec!["phony"])
            .with_order_dependencies(vec!["stamp"]);
        let state = BuildState::new();
        let rebuilder = MTimeRebuilder::new(&fs, &state, "/");
        prop_assert_eq!(rebuilder.decide(&invocation, None), Decision::Skip);
    }

    #[test]
    fn oldest_output_decides(
        outputs in proptest::collection::vec(0u64..1_000, 1..4),
        input in 0u64..1_000,
    ) {
        let fs = MemoryFilesystem::new();
        let names: Vec<String> = (0..outputs.len()).map(|i| format!("out{}", i)).collect();
        for (name, secs) in names.iter().zip(&outputs) {
            place(&fs, &format!("/w/{}", name), Stamp::Modified(UNIX_EPOCH + Duration::from_secs(*secs)));
        }
        place(&fs, "/w/in", Stamp::Modified(UNIX_EPOCH + Duration::from_secs(input)));
        let invocation = Invocation::new()
            .with_executable(Executable::determine("gen"))
            .with_working_directory("/w")
            .with_inputs(vec!["in"])
            .with_outputs(names.clone());
        let state = BuildState::new();
        let decision = MTimeRebuilder::new(&fs, &state, "/").decide(&invocation, None);
        let oldest = outputs.iter().copied().min().unwrap_or(0);
        prop_assert_eq!(decision == Decision::Skip, input <= oldest);
    }
}
