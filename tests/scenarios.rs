use std::time::Duration;

use board_io::config::BoardConfig;
use board_io::hal::{Direction, Irq, Level};
use board_io::sim::{HalOp, SimHal};
use board_io::transport::TransportBuffers;
use board_io::{Board, TransportError, TransportState};

const BUTTON_PIN: u8 = 2;

fn board() -> Board<SimHal> {
    let config = BoardConfig::default();
    let hal = SimHal::from_config(&config);
    match Board::init(hal, &config) {
        Ok(board) => board,
        Err(e) => panic!("board init failed: {}", e),
    }
}

#[test]
fn test_press_scenario() {
    let board = board();

    board.with_hal(|hal| hal.drive_pin(BUTTON_PIN, Level::Low).unwrap());
    assert_eq!(board.service_pending(), 1);
    board.with_hal(|hal| {
        assert!(hal.journal().contains(&HalOp::TimerStart(10)));
        assert!(!hal.interrupt_enabled(BUTTON_PIN));
    });

    board.advance(Duration::from_millis(10));
    board.service_pending();

    assert!(board.read_and_clear(0).unwrap());
    assert!(!board.read_and_clear(0).unwrap());
}

#[test]
fn test_bounce_within_window_counts_once() {
    let board = board();
    for cycles in [1, 4, 12] {
        board.with_hal(|hal| {
            hal.drive_pin(BUTTON_PIN, Level::Low).unwrap();
            hal.bounce(BUTTON_PIN, Level::Low, cycles).unwrap();
        });
        board.service_pending();
        board.advance(Duration::from_millis(3));
        board.with_hal(|hal| hal.bounce(BUTTON_PIN, Level::Low, cycles).unwrap());
        board.service_pending();
        board.advance(Duration::from_millis(7));
        board.service_pending();

        assert!(board.read_and_clear(0).unwrap());
        assert!(!board.read_and_clear(0).unwrap());

        board.with_hal(|hal| hal.drive_pin(BUTTON_PIN, Level::High).unwrap());
        board.service_pending();
    }
}

#[test]
fn test_send_scenario() {
    let board = board();
    let chip_select = BoardConfig::default().transport.chip_select_pin;
    board.with_hal(|hal| hal.clear_journal());

    board.send(&[0x01, 0x02, 0x03]).unwrap();
    assert_eq!(board.transport_state(), TransportState::TransferArmed);

    board.with_hal(|hal| {
        let journal = hal.journal();
        let cs = journal
            .iter()
            .position(|op| *op == HalOp::WritePin(chip_select, Level::Low))
            .unwrap();
        let dma = journal
            .iter()
            .position(|op| matches!(op, HalOp::StartChannel(_)))
            .unwrap();
        assert!(cs < dma);
        hal.complete_dma().unwrap();
    });

    board.on_interrupt(Irq::DmaTransmitComplete);
    assert_eq!(board.transport_state(), TransportState::Idle);
    assert_eq!(board.last_transmitted(), Some(vec![0x01, 0x02, 0x03]));
    board.with_hal(|hal| {
        assert_eq!(hal.level(chip_select), Some(Level::High));
        assert_eq!(hal.captured_frames(), &[vec![0x01, 0x02, 0x03]]);
    });
}

#[test]
fn test_second_acquire_is_busy() {
    let mut buffers = TransportBuffers::new(32);
    let first = buffers.acquire_for_transmit(&[1, 2]).unwrap();
    assert_eq!(
        buffers.acquire_for_transmit(&[3]).unwrap_err(),
        TransportError::BufferBusy(Direction::Transmit)
    );
    buffers.release_on_complete(first).unwrap();
    assert!(buffers.acquire_for_transmit(&[3]).is_ok());
}

#[test]
fn test_disabled_until_reinitialized() {
    let board = board();
    board.power_up().unwrap();
    board.power_down().unwrap();

    assert_eq!(board.send(&[1]), Err(TransportError::TransportDisabled));
    assert_eq!(board.try_receive(), Err(TransportError::TransportDisabled));
    assert_eq!(board.begin_receive(4), Err(TransportError::TransportDisabled));

    board.reinitialize_transport().unwrap();
    assert_eq!(board.try_receive(), Ok(None));
    assert!(board.send(&[1]).is_ok());
}

#[test]
fn test_data_ready_then_receive() {
    let board = board();
    board.power_up().unwrap();
    board.with_hal(|hal| hal.queue_peer_frame(&[0xDE, 0xAD]).unwrap());
    board.service_pending();
    assert!(board.take_data_ready());

    board.begin_receive(2).unwrap();
    board.with_hal(|hal| hal.complete_dma().unwrap());
    board.service_pending();

    assert_eq!(board.try_receive(), Ok(Some(vec![0xDE, 0xAD])));
    assert_eq!(board.try_receive(), Ok(None));
}
