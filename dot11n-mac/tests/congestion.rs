use dot11n_core::Dot11nConfig;
use dot11n_mac::{ContentionCtrl, RetryVerdict};

#[test]
fn window_doubles_until_capped() {
    let params = Dot11nConfig::default().edca.best_effort;
    let mut cc = ContentionCtrl::new(&params, 10, 4);
    assert_eq!(cc.cw(), params.cw_min);
    let mut seen = vec![cc.cw()];
    for _ in 0..8 {
        assert_eq!(cc.on_failure(100, 2347), RetryVerdict::Retry);
        seen.push(cc.cw());
    }
    assert!(seen.windows(2).all(|w| w[1] == ((w[0] + 1) * 2 - 1).min(params.cw_max)));
    assert_eq!(cc.cw(), params.cw_max);
    assert_eq!(cc.qsrc(), 8);
}

#[test]
fn long_frames_use_the_long_counter() {
    let params = Dot11nConfig::default().edca.best_effort;
    let mut cc = ContentionCtrl::new(&params, 7, 2);
    assert_eq!(cc.on_failure(3000, 2347), RetryVerdict::Retry);
    assert_eq!((cc.qsrc(), cc.qlrc()), (0, 1));
    assert_eq!(cc.on_failure(3000, 2347), RetryVerdict::Drop);
    assert_eq!((cc.qlrc(), cc.cw()), (0, params.cw_min));
}
