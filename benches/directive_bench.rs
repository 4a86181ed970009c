use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};

use jogwheel::gcode::{Axis, Directive};
use jogwheel::session::JogCode;

fn bench_directive_formatting(c: &mut Criterion) {
    c.bench_function("format_jog_batch", |b| {
        b.iter(|| {
            let mut out = String::with_capacity(256);
            out.push_str(&Directive::RelativeFeed { feed: 600.0 }.to_string());
            for _ in 0..8 {
                out.push('\n');
                out.push_str(
                    &Directive::Feed {
                        axis: Axis::X,
                        distance: black_box(1.5625),
                        feed: None,
                    }
                    .to_string(),
                );
            }
            out
        })
    });

    c.bench_function("format_fixed_move", |b| {
        b.iter(|| {
            Directive::Feed {
                axis: Axis::Y,
                distance: black_box(-5.0),
                feed: Some(300.0),
            }
            .to_string()
        })
    });
}

fn bench_wire_decode(c: &mut Criterion) {
    let raw = serde_json::json!({"cmd": "fixed", "axis": "y", "speed": 300.0, "dist": -5.0});
    c.bench_function("decode_wire_command", |b| {
        b.iter(|| serde_json::from_value::<JogCode>(black_box(raw.clone())).unwrap())
    });
}

criterion_group!(benches, bench_directive_formatting, bench_wire_decode);
criterion_main!(benches);
