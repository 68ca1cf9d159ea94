#[cfg(test)]
mod proptest_script {
    use crate::script::*;
    use proptest::prelude::*;

    const DEVICES: [&str; 3] = ["SV-OX-01", "SV-FU-01", "SV-N2-01"];

    fn render(offsets: &[u64], states: &[[bool; 3]]) -> String {
        let mut src = String::from("Limits\nPT-OX-01\n900\nSequence\nTimestamp (ms),");
        src.push_str(&DEVICES.join(","));
        src.push('\n');
        for (at, row) in offsets.iter().zip(states) {
            let cells: Vec<&str> = row.iter().map(|open| if *open { "1" } else { "0" }).collect();
            src.push_str(&format!("{at},{}\n", cells.join(",")));
        }
        src
    }

    fn steps() -> impl Strategy<Value = (Vec<u64>, Vec<[bool; 3]>)> {
        (1usize..40).prop_flat_map(|len| {
            (
                prop::collection::vec(0u64..5_000, len),
                prop::collection::vec(any::<[bool; 3]>(), len),
            )
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        // Delays are the differences of consecutive elapsed times
        #[test]
        fn delays_are_differences((gaps, states) in steps()) {
            let mut offsets: Vec<u64> = gaps.iter().scan(0u64, |at, gap| {
                *at += gap;
                Some(*at)
            }).collect();
            offsets[0] = 0;
            for i in 1..offsets.len() {
                offsets[i] = offsets[i].max(offsets[i - 1]);
            }

            let script = Script::parse_str(&render(&offsets, &states)).unwrap();
            prop_assert_eq!(script.events().len(), offsets.len());
            for (i, event) in script.events().iter().enumerate().skip(1) {
                prop_assert_eq!(event.delay_ms(), offsets[i] - offsets[i - 1]);
            }
            prop_assert_eq!(script.offsets_ms(), offsets);
        }

        // Any backwards step in time is rejected
        #[test]
        fn backwards_time_rejected(
            (gaps, states) in steps(),
            back in 1u64..1_000,
        ) {
            prop_assume!(gaps.len() >= 3);
            let mut offsets: Vec<u64> = gaps.iter().scan(0u64, |at, gap| {
                *at += gap;
                Some(*at)
            }).collect();
            offsets[0] = 0;
            offsets[1] = offsets[1].max(back);
            offsets[2] = offsets[1] - back;

            let result = Script::parse_str(&render(&offsets, &states));
            let rejected = matches!(result, Err(ScriptError::NonMonotonicTime { .. }));
            prop_assert!(rejected, "Expected NonMonotonicTime, got {:?}", result);
        }

        // Writing a script and parsing it back yields the same script
        #[test]
        fn write_then_parse_is_identity(
            (gaps, states) in steps(),
            check_at in any::<prop::sample::Index>(),
            min_psi in 0u32..2_000,
        ) {
            let mut events: Vec<Event> = gaps.iter().zip(&states).map(|(gap, row)| Event::SetStates {
                delay_ms: *gap,
                states: DEVICES.iter().map(|d| d.to_string()).zip(row.iter().copied()).collect(),
            }).collect();
            if let Some(Event::SetStates { delay_ms, .. }) = events.first_mut() {
                *delay_ms = 0;
            }
            let slot = 1 + check_at.index(events.len());
            events.insert(slot, Event::CheckPressure {
                delay_ms: 25,
                device: "PT-OX-01".to_string(),
                min_psi: f64::from(min_psi),
            });

            let mut limits = DeviceLimits::default();
            limits.insert("PT-OX-01", 900.0);
            let devices = DEVICES.iter().map(|d| d.to_string()).collect();
            let script = Script::new(limits, devices, events);

            let reparsed = Script::parse_str(&script.to_csv_string().unwrap()).unwrap();
            prop_assert_eq!(reparsed, script);
        }
    }
}
