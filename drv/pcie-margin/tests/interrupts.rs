// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod mock;

use drv_pcie_margin::{
    Disposition, IntrSource, MarginConfig, Reply, StatusReport,
};
use drv_pcie_margin_api::{ControlWord, MarginError};
use mock::*;

fn no_command() -> ControlWord {
    ControlWord::new(0, 7, false, 0x9c)
}

fn completed(s: Disposition) -> StatusReport {
    match s {
        Disposition::Completed(r) => r,
        other => panic!("expected a completed command, got {other:?}"),
    }
}

#[test]
fn spurious_interrupt() {
    let dut = dut();
    assert_eq!(
        dut.on_margining_interrupt(),
        Err(MarginError::NoPendingInterrupt)
    );
    assert_eq!(dut.service_interrupt(), None);
    // Nothing acked, nothing written.
    assert!(dut.hw().calls().is_empty());
}

#[test]
fn acks_only_what_it_handles() {
    let dut = dut();
    for n in [1, 2] {
        dut.hw().set_control(n, no_command());
        dut.hw().raise(command_bit(n));
    }
    dut.hw().set_control(3, no_command());
    dut.hw().raise(status_bit(3));

    let mut sources = vec![];
    while dut.hw().pending() != 0 {
        sources.push(dut.on_margining_interrupt().unwrap().source);
    }
    assert_eq!(
        sources,
        [
            IntrSource::Command(lane(1)),
            IntrSource::Command(lane(2)),
            IntrSource::Status(lane(3)),
        ]
    );

    let acks: Vec<u64> = dut
        .hw()
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::Ack(bits) => Some(bits),
            _ => None,
        })
        .collect();
    assert_eq!(acks, [command_bit(1), command_bit(2), status_bit(3)]);
}

#[test]
fn error_limit_stops_before_reporting() {
    let dut = dut();
    command(&dut, 6, timing(2)).unwrap();
    drain(&dut);
    dut.hw().set_count(6, 0x2a);
    dut.hw().take_calls();

    // A command on another lane is pending too; the error limit goes first.
    dut.hw().set_control(1, no_command());
    dut.hw().raise(command_bit(1) | error_limit_bit(6));

    let s = dut.on_margining_interrupt().unwrap();
    assert_eq!(s.source, IntrSource::ErrorLimit(lane(6)));
    let Disposition::TooManyErrors(report) = s.disposition else {
        panic!("unexpected {:?}", s.disposition);
    };
    assert_eq!(report.lane, lane(6));
    assert_eq!(report.margin_type, 3);

    let calls = dut.hw().take_calls();
    let Some(Call::Status(reply)) = calls.last().copied() else {
        panic!("no reply in {calls:?}");
    };
    assert_eq!(
        calls,
        [
            Call::Ack(error_limit_bit(6)),
            Call::Select(1 << 6),
            Call::Disarm,
            Call::ReadCount(1 << 6),
            Call::Status(reply),
        ]
    );
    assert_eq!(reply.payload(), 0x2a);
    assert_eq!(reply.lane(), 6);

    assert!(!dut.scheduled().contains(lane(6)));
    assert_eq!(dut.last_step(lane(6)), None);
    assert_eq!(dut.hw().pending(), command_bit(1));
}

#[test]
fn error_limit_stops_even_if_reply_fails() {
    let dut = dut();
    command(&dut, 6, timing(2)).unwrap();
    drain(&dut);
    dut.hw().fail_status_writes();
    dut.hw().take_calls();

    assert_eq!(
        dut.error_limit_exceeded(lane(6)),
        Err(MarginError::StatusWriteFailed)
    );
    assert!(dut.hw().calls().contains(&Call::Disarm));
    assert!(!dut.scheduled().contains(lane(6)));
}

#[test]
fn ready_starts_a_session() {
    let dut = dut();
    command(&dut, 2, timing(1)).unwrap();
    drain(&dut);
    assert!(dut.last_step(lane(2)).is_some());
    dut.hw().take_calls();

    dut.hw().raise(READY_BIT | ABORT_BIT);
    let s = dut.on_margining_interrupt().unwrap();
    assert_eq!(s.source, IntrSource::Ready);
    assert_eq!(s.disposition, Disposition::SessionReady);
    assert_eq!(dut.hw().calls(), [Call::Ack(READY_BIT), Call::Ready(true)]);
    assert_eq!(dut.last_step(lane(2)), None);
    assert_eq!(dut.hw().pending(), ABORT_BIT);
}

#[test]
fn abort_stops_everything() {
    let dut = dut_with(MarginConfig {
        lanes: 4,
        ..MarginConfig::default()
    });
    command(&dut, 2, timing(1)).unwrap();
    drain(&dut);
    assert!(dut.error_counting(lane(2)));
    dut.hw().set_count(2, 3);
    dut.hw().take_calls();

    dut.hw().raise(ABORT_BIT);
    let s = dut.on_margining_interrupt().unwrap();
    assert_eq!(s.disposition, Disposition::Aborted);
    assert_eq!(
        dut.hw().calls(),
        [
            Call::Ack(ABORT_BIT),
            Call::Select(0b1111),
            Call::Disarm,
            Call::ClearCount(0),
            Call::ClearCount(1),
            Call::ClearCount(2),
            Call::ClearCount(3),
            Call::Counting(0, false),
            Call::Counting(1, false),
            Call::Counting(2, false),
            Call::Counting(3, false),
            Call::Ready(false),
        ]
    );
    assert!(!dut.error_counting(lane(2)));
    assert_eq!(dut.last_step(lane(2)), None);
    assert!(dut.is_idle());
}

#[test]
fn capability_reports() {
    let dut = dut();
    for (query, expected) in [
        (0x88, 0b1_0111),
        (0x89, 50),
        (0x8a, 16),
        (0x8b, 40),
        (0x8c, 30),
        (0x8d, 31),
        (0x8e, 31),
        (0x8f, 39),
        (0x90, 15),
    ] {
        let s = command(&dut, 0, ControlWord::new(6, 1, false, query)).unwrap();
        let r = completed(s.disposition);
        assert_eq!(r.reply, Reply::Echo(expected), "query {query:#x}");
        let w = dut.hw().last_status().unwrap();
        assert_eq!(w.payload(), expected);
        assert_eq!(w.margin_type(), 1);
        assert_eq!(w.receiver(), 6);
    }
}

#[test]
fn set_error_limit() {
    let dut = dut();
    for rx in [0, 6] {
        let w = ControlWord::new(rx, 2, false, 0xc0 | 12);
        let s = command(&dut, 5, w).unwrap();
        assert_eq!(completed(s.disposition).reply, Reply::Echo(0xcc));
        assert!(dut.hw().calls().contains(&Call::SetLimit(5, 12)));
        assert_eq!(dut.hw().last_status().unwrap().payload(), 0xcc);
    }
}

#[test]
fn clear_error_log() {
    let dut = dut();
    dut.hw().set_count(2, 7);
    let s = command(&dut, 2, ControlWord::new(6, 2, false, 0x55)).unwrap();
    assert_eq!(completed(s.disposition).reply, Reply::Echo(0x55));
    assert!(dut.hw().calls().contains(&Call::ClearCount(2)));
}

#[test]
fn go_to_normal() {
    let dut = dut();
    command(&dut, 7, timing(3)).unwrap();
    drain(&dut);
    assert!(dut.error_counting(lane(7)));
    dut.hw().take_calls();

    let s = command(&dut, 7, ControlWord::new(6, 2, false, 0x0f)).unwrap();
    assert_eq!(completed(s.disposition).reply, Reply::Echo(0x0f));

    let calls = dut.hw().take_calls();
    let Some(Call::Status(reply)) = calls.last().copied() else {
        panic!("no reply in {calls:?}");
    };
    assert_eq!(
        calls,
        [
            Call::Ack(command_bit(7)),
            Call::Select(1 << 7),
            Call::Disarm,
            Call::Counting(7, false),
            Call::Status(reply),
        ]
    );
    assert_eq!(reply.payload(), 0x0f);
    assert!(!dut.error_counting(lane(7)));
    assert_eq!(dut.last_step(lane(7)), None);
}

#[test]
fn go_to_normal_drops_a_waiting_lane() {
    let dut = dut();
    command(&dut, 1, timing(1)).unwrap();
    command(&dut, 2, timing(1)).unwrap();
    command(&dut, 2, ControlWord::new(0, 2, false, 0x0f)).unwrap();
    assert_eq!(dut.scheduled(), lane(1).mask());

    let results = drain(&dut);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, lane(1));
    assert!(dut.is_idle());
}

#[test]
fn no_command_echoes() {
    let dut = dut();
    let s = command(&dut, 9, no_command()).unwrap();
    let r = completed(s.disposition);
    assert_eq!(r.reply, Reply::Echo(0x9c));
    assert_eq!(r.lane, lane(9));
    assert_eq!(dut.hw().last_status().unwrap().lane(), 9);
}

#[test]
fn wrong_receiver_gets_no_reply() {
    let dut = dut();
    // Reports go to receiver 6 only.
    assert_eq!(
        command(&dut, 0, ControlWord::new(3, 1, false, 0x88)),
        Err(MarginError::InvalidReceiverNumber)
    );
    // Step margining likewise.
    assert_eq!(
        command(&dut, 0, ControlWord::new(1, 3, false, 0x01)),
        Err(MarginError::InvalidReceiverNumber)
    );
    assert!(dut.hw().statuses().is_empty());
    assert!(dut.is_idle());

    // Not fatal.
    host_writes(&dut, 0, ControlWord::new(3, 1, false, 0x88));
    assert_eq!(dut.service_interrupt(), None);
}

#[test]
fn reserved_encodings_get_no_reply() {
    let dut = dut();
    for w in [
        ControlWord::new(6, 5, false, 0x00),
        ControlWord::new(6, 1, false, 0x91),
        ControlWord::new(6, 2, false, 0x80),
    ] {
        assert_eq!(command(&dut, 0, w), Err(MarginError::ReservedCommand));
    }
    assert!(dut.hw().statuses().is_empty());
    host_writes(&dut, 0, ControlWord::new(6, 6, false, 0x00));
    assert_eq!(dut.service_interrupt(), None);
}

#[test]
#[should_panic]
fn malformed_no_command_is_fatal() {
    let dut = dut();
    host_writes(&dut, 0, ControlWord::new(0, 7, false, 0x00));
    dut.service_interrupt();
}

#[test]
fn malformed_no_command_error() {
    let dut = dut();
    assert_eq!(
        command(&dut, 0, ControlWord::new(2, 7, false, 0x9c)),
        Err(MarginError::InvalidArgument)
    );
}

#[test]
#[should_panic]
fn status_write_failure_is_fatal() {
    let dut = dut();
    dut.hw().fail_status_writes();
    host_writes(&dut, 0, no_command());
    dut.service_interrupt();
}

#[test]
fn lane_past_configured_count() {
    let dut = dut_with(MarginConfig {
        lanes: 4,
        ..MarginConfig::default()
    });
    dut.hw().raise(command_bit(5));
    assert_eq!(dut.on_margining_interrupt(), Err(MarginError::OutOfRange));
}

#[test]
fn bad_config_rejected() {
    for lanes in [0, 17] {
        let config = MarginConfig {
            lanes,
            ..MarginConfig::default()
        };
        assert!(matches!(
            drv_pcie_margin::Margining::new(
                MockHw::new(),
                drv_pcie_margin::StepQueue::<1>::new(),
                config,
            ),
            Err(MarginError::OutOfRange)
        ));
    }
}
