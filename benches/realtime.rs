use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ptt_voice::audio::{FrameAccumulator, JitterBuffer, PcmFrame};
use ptt_voice::constants::FRAME_SAMPLES;
use ptt_voice::protocol::rtp::{self, RtpHeader};

fn bench_accumulator(c: &mut Criterion) {
    let accumulator = FrameAccumulator::new();
    let burst = [1000i16; 192];
    let mut frame: PcmFrame = [0; FRAME_SAMPLES];

    c.bench_function("accumulator_append_192", |b| {
        b.iter(|| {
            let mut ready = accumulator.append(black_box(&burst), &mut frame);
            while ready {
                black_box(&frame);
                ready = accumulator.next_frame(&mut frame);
            }
        })
    });
}

fn bench_jitter(c: &mut Criterion) {
    let jitter = JitterBuffer::new();
    let payload = [0x5Au8; 40];
    let mut datagram = bytes::BytesMut::with_capacity(64);
    let mut out = Vec::with_capacity(1500);
    let mut sequence = 0u16;

    c.bench_function("jitter_enqueue_dequeue", |b| {
        b.iter(|| {
            let header = RtpHeader::opus(false, sequence, u32::from(sequence) * 960, 42);
            rtp::packetize(&header, &payload, &mut datagram);
            jitter.enqueue(black_box(&datagram));
            black_box(jitter.dequeue(&mut out));
            sequence = sequence.wrapping_add(1);
        })
    });

    c.bench_function("jitter_enqueue_full", |b| {
        b.iter(|| {
            let header = RtpHeader::opus(false, sequence, 0, 42);
            rtp::packetize(&header, &payload, &mut datagram);
            jitter.enqueue(black_box(&datagram));
            sequence = sequence.wrapping_add(1);
        })
    });
}

criterion_group!(benches, bench_accumulator, bench_jitter);
criterion_main!(benches);
