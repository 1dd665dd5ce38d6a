//! Quarter float codec.
//!
//! A quarter is one byte laid out as `S EEEE MMM`: a sign bit, a 4-bit exponent and a
//! 3-bit mantissa. The exponent is interpreted relative to an external `bias`, so the same
//! byte means different values under different biases.
//!
//! - exponent `0`: subnormal, `m/8 * 2^(1 - bias)`
//! - exponent `1..=14`: normal, `(1 + m/8) * 2^(e - bias)`
//! - exponent `15`: infinity when the mantissa is zero, NaN otherwise
//!
//! Non-zero values that would round to zero encode as the smallest magnitude instead, and
//! finite values beyond the largest magnitude saturate to [`QUARTER_MAX`] / [`QUARTER_MIN`].
//!
//! At bias 0 the pattern [`QUARTER_SECOND_MIN`] is reserved: it decodes like
//! [`QUARTER_MIN`] and the encoder never produces it.

use tracing::debug;

pub type Quarter = u8;

const SIGN_MASK: u8 = 0x80;
const EXPONENT_MASK: u8 = 0x78;
const MANTISSA_MASK: u8 = 0x07;
const MANTISSA_BITS: i32 = 3;
const MANTISSA_STEPS: f32 = 8.0;
const SPECIAL_EXPONENT: i32 = 15;
const MAX_NORMAL_EXPONENT: i32 = 14;

pub const QUARTER_ZERO: Quarter = 0x00;
pub const QUARTER_SMALLEST: Quarter = 0x01;
pub const QUARTER_MAX: Quarter = 0x77;
pub const QUARTER_MIN: Quarter = 0xF7;
pub const QUARTER_SECOND_MIN: Quarter = 0xF6;
pub const QUARTER_POSITIVE_INFINITY: Quarter = 0x78;
pub const QUARTER_NEGATIVE_INFINITY: Quarter = 0xF8;
pub const QUARTER_NAN: Quarter = 0x7F;

/// Bias search window used when materializing a tensor to 8 bits.
pub const MATERIALIZE_MIN_BIAS: i32 = 4;
pub const MATERIALIZE_MAX_BIAS: i32 = 15;

fn power_of_two(exponent: i32) -> f32 {
    2f32.powi(exponent)
}

/// Decode `code` to an `f32` using `bias`.
pub fn decode(code: Quarter, bias: i32) -> f32 {
    if bias == 0 && code == QUARTER_SECOND_MIN {
        return decode(QUARTER_MIN, 0);
    }
    let negative = code & SIGN_MASK != 0;
    let exponent = ((code & EXPONENT_MASK) >> MANTISSA_BITS) as i32;
    let mantissa = (code & MANTISSA_MASK) as f32;

    let magnitude = if exponent == SPECIAL_EXPONENT {
        if mantissa != 0.0 {
            return f32::NAN;
        }
        f32::INFINITY
    } else if exponent == 0 {
        mantissa / MANTISSA_STEPS * power_of_two(1 - bias)
    } else {
        (1.0 + mantissa / MANTISSA_STEPS) * power_of_two(exponent - bias)
    };

    if negative {
        -magnitude
    } else {
        magnitude
    }
}

/// Encode `value` using `bias`, rounding to the nearest representable magnitude.
pub fn encode(value: f32, bias: i32) -> Quarter {
    if value.is_nan() {
        return QUARTER_NAN;
    }
    let sign = if value.is_sign_negative() { SIGN_MASK } else { 0 };
    let magnitude = value.abs();
    if magnitude.is_infinite() {
        return sign | QUARTER_POSITIVE_INFINITY;
    }
    if magnitude == 0.0 {
        return sign | QUARTER_ZERO;
    }

    let code = sign | encode_magnitude(magnitude, bias);
    if bias == 0 && code == QUARTER_SECOND_MIN {
        QUARTER_MIN
    } else {
        code
    }
}

fn encode_magnitude(magnitude: f32, bias: i32) -> Quarter {
    if magnitude >= decode(QUARTER_MAX, bias) {
        return QUARTER_MAX;
    }

    let min_normal = power_of_two(1 - bias);
    if magnitude < min_normal {
        let step = power_of_two(1 - bias - MANTISSA_BITS);
        // 8 steps is exactly the smallest normal, which shares the bit pattern 0x08.
        let steps = (magnitude / step).round() as u8;
        return steps.max(QUARTER_SMALLEST);
    }

    let mut exponent = ((magnitude.to_bits() >> 23) & 0xFF) as i32 - 127;
    let fraction = magnitude / power_of_two(exponent) - 1.0;
    let mut mantissa = (fraction * MANTISSA_STEPS).round() as i32;
    if mantissa == MANTISSA_STEPS as i32 {
        mantissa = 0;
        exponent += 1;
    }

    let field = exponent + bias;
    if field > MAX_NORMAL_EXPONENT {
        return QUARTER_MAX;
    }
    ((field << MANTISSA_BITS) | mantissa) as Quarter
}

/// `a + b`, each decoded at its own bias, re-encoded at `result_bias`.
pub fn add(a: Quarter, bias_a: i32, b: Quarter, bias_b: i32, result_bias: i32) -> Quarter {
    encode(decode(a, bias_a) + decode(b, bias_b), result_bias)
}

pub fn subtract(a: Quarter, bias_a: i32, b: Quarter, bias_b: i32, result_bias: i32) -> Quarter {
    encode(decode(a, bias_a) - decode(b, bias_b), result_bias)
}

pub fn multiply(a: Quarter, bias_a: i32, b: Quarter, bias_b: i32, result_bias: i32) -> Quarter {
    encode(decode(a, bias_a) * decode(b, bias_b), result_bias)
}

/// Division follows IEEE-754: `x/0` is a signed infinity and `0/0` is NaN.
pub fn divide(a: Quarter, bias_a: i32, b: Quarter, bias_b: i32, result_bias: i32) -> Quarter {
    encode(decode(a, bias_a) / decode(b, bias_b), result_bias)
}

/// Largest bias in `min_allowed..=max_allowed` whose range strictly contains
/// `[observed_min, observed_max]`, or `min_allowed` when none does.
pub fn estimate_bias(min_allowed: i32, max_allowed: i32, observed_min: f32, observed_max: f32) -> i32 {
    for bias in (min_allowed..=max_allowed).rev() {
        let bias_max = decode(QUARTER_MAX, bias);
        let bias_min = -bias_max;
        if observed_min > bias_min && observed_max < bias_max {
            debug!(bias, observed_min, observed_max, "estimated quarter bias");
            return bias;
        }
    }
    min_allowed
}
