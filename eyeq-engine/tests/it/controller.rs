use eyeq_engine::{Params, RateControllerState, RcState, ALPHA_SHIFT};

#[test]
fn marks_converge_to_the_floor() {
    let params = Params::default().rfair_initial(5_000);
    let rc = RateControllerState::new(0, 1, &params);

    let mut previous = rc.rfair();
    let mut now = 0;
    for _ in 0..1_000 {
        now += params.rfair_decrease_interval_us;
        rc.on_receive(true, 0, now, &params);

        let rfair = rc.rfair();
        assert!(rfair <= previous);
        previous = rfair;
    }

    assert_eq!(rc.rfair(), params.min_rfair);
    assert_eq!(rc.state(), RcState::FastRecovery);
    assert!(rc.alpha() > (1 << ALPHA_SHIFT) / 2);
}

#[test]
fn first_feedback_mark_backs_off() {
    let params = Params::default();
    let rc = RateControllerState::new(0, 1, &params);

    assert!(rc.on_receive(true, 0, params.rfair_decrease_interval_us, &params));
    assert!(rc.rfair() < params.rfair_initial);
    assert_eq!(rc.stats().rfair_target, params.rfair_initial);
}

#[test]
fn clean_feedback_converges_to_the_ceiling() {
    let params = Params::default();
    let rc = RateControllerState::new(0, 1, &params);

    let mut previous = rc.rfair();
    let mut now = 0;
    for _ in 0..1_100 {
        now += params.rfair_increase_interval_us;
        assert!(rc.on_receive(false, 0, now, &params));

        let rfair = rc.rfair();
        assert!(rfair >= previous);
        previous = rfair;
    }

    assert_eq!(rc.rfair(), params.max_tx_rate);
    assert_eq!(rc.state(), RcState::AdditiveIncrease);
}

#[test]
fn backoff_then_recovery() {
    let params = Params::default();
    let rc = RateControllerState::new(0, 1, &params);
    rc.set_alpha(1 << (ALPHA_SHIFT - 1));

    let mut now = params.rfair_decrease_interval_us;
    assert!(rc.on_receive(true, 0, now, &params));
    assert_eq!(rc.rfair(), 48);

    let mut recovered = Vec::new();
    for _ in 0..6 {
        now += params.rfair_increase_interval_us;
        rc.on_receive(false, 0, now, &params);
        recovered.push((rc.rfair(), rc.state()));
    }

    // Five bisection steps towards 100, then additive increase.
    assert!(recovered[..5].iter().all(|(rfair, state)| *rfair < 100 && *state == RcState::FastRecovery));
    assert!(recovered.windows(2).all(|w| w[0].0 < w[1].0));
    assert_eq!(recovered[5], (98 + params.rfair_increment, RcState::AdditiveIncrease));
}
