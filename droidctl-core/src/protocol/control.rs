//! Control messages written to the mirroring agent's control socket.
//!
//! Touch events are fixed 28-byte big-endian records:
//!
//! ```text
//! offset size field
//!      0    1 type        (2 = inject touch)
//!      1    1 action      (0 down, 1 up, 2 move)
//!      2    8 pointer id  (i64, -1 = generic finger)
//!     10    4 x           (i32, video coordinates)
//!     14    4 y           (i32)
//!     18    2 width       (u16, video width)
//!     20    2 height      (u16, video height)
//!     22    2 pressure    (u16 fixed point, 1.0 = 0xffff)
//!     24    4 buttons     (u32, always 1)
//! ```

use crate::error::AdbError;

pub const TOUCH_EVENT_SIZE: usize = 28;

/// Control message type for touch injection.
pub const CONTROL_TYPE_INJECT_TOUCH: u8 = 2;

/// Pointer id used for all single-finger input.
pub const POINTER_ID_GENERIC_FINGER: i64 = -1;

const PRIMARY_BUTTON: u32 = 1;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TouchAction {
    Down = 0,
    Up = 1,
    Move = 2,
}

impl TryFrom<u8> for TouchAction {
    type Error = AdbError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Down),
            1 => Ok(Self::Up),
            2 => Ok(Self::Move),
            _ => Err(AdbError::UnknownVariant {
                type_name: "TouchAction",
                value: value as u64,
            }),
        }
    }
}

/// A single touch sample in video coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TouchEvent {
    pub action: TouchAction,
    pub x: i32,
    pub y: i32,
    /// Size of the coordinate space (the negotiated video size).
    pub width: u16,
    pub height: u16,
    /// 0.0 ..= 1.0
    pub pressure: f32,
}

impl TouchEvent {
    pub fn new(action: TouchAction, x: i32, y: i32, width: u16, height: u16, pressure: f32) -> Self {
        Self {
            action,
            x,
            y,
            width,
            height,
            pressure,
        }
    }

    /// Map a point on the display view into video coordinates.
    ///
    /// `view_*` is the size of the on-screen view; the result is clamped
    /// into the video frame.
    pub fn from_view(
        action: TouchAction,
        view_x: f32,
        view_y: f32,
        view_width: f32,
        view_height: f32,
        video_width: u16,
        video_height: u16,
        pressure: f32,
    ) -> Self {
        let scale = |v: f32, view: f32, video: u16| -> i32 {
            if view <= 0.0 {
                return 0;
            }
            let mapped = (v / view * video as f32) as i32;
            mapped.clamp(0, video as i32)
        };
        Self::new(
            action,
            scale(view_x, view_width, video_width),
            scale(view_y, view_height, video_height),
            video_width,
            video_height,
            pressure,
        )
    }

    fn pressure_fixed(&self) -> u16 {
        let p = if self.pressure.is_nan() {
            0.0
        } else {
            self.pressure.clamp(0.0, 1.0)
        };
        (p * 65535.0).round() as u16
    }

    pub fn encode(&self) -> [u8; TOUCH_EVENT_SIZE] {
        let mut out = [0u8; TOUCH_EVENT_SIZE];
        out[0] = CONTROL_TYPE_INJECT_TOUCH;
        out[1] = self.action as u8;
        out[2..10].copy_from_slice(&POINTER_ID_GENERIC_FINGER.to_be_bytes());
        out[10..14].copy_from_slice(&self.x.to_be_bytes());
        out[14..18].copy_from_slice(&self.y.to_be_bytes());
        out[18..20].copy_from_slice(&self.width.to_be_bytes());
        out[20..22].copy_from_slice(&self.height.to_be_bytes());
        out[22..24].copy_from_slice(&self.pressure_fixed().to_be_bytes());
        out[24..28].copy_from_slice(&PRIMARY_BUTTON.to_be_bytes());
        out
    }

    /// Inverse of [`encode`](Self::encode); pressure comes back quantized.
    pub fn decode(bytes: &[u8; TOUCH_EVENT_SIZE]) -> Result<Self, AdbError> {
        if bytes[0] != CONTROL_TYPE_INJECT_TOUCH {
            return Err(AdbError::UnknownVariant {
                type_name: "ControlMessageType",
                value: bytes[0] as u64,
            });
        }
        let i32_at = |i: usize| i32::from_be_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let u16_at = |i: usize| u16::from_be_bytes([bytes[i], bytes[i + 1]]);
        Ok(Self {
            action: TouchAction::try_from(bytes[1])?,
            x: i32_at(10),
            y: i32_at(14),
            width: u16_at(18),
            height: u16_at(20),
            pressure: u16_at(22) as f32 / 65535.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn down_event_bytes() {
        let ev = TouchEvent::new(TouchAction::Down, 100, 200, 720, 1600, 1.0);
        let b = ev.encode();
        assert_eq!(b.len(), 28);
        assert_eq!(b[0], 2);
        assert_eq!(b[1], 0);
        assert_eq!(&b[2..10], &[0xff; 8]);
        assert_eq!(&b[10..14], &100i32.to_be_bytes());
        assert_eq!(&b[14..18], &200i32.to_be_bytes());
        assert_eq!(&b[18..20], &720u16.to_be_bytes());
        assert_eq!(&b[20..22], &1600u16.to_be_bytes());
        assert_eq!(&b[22..24], &[0xff, 0xff]);
        assert_eq!(&b[24..28], &[0, 0, 0, 1]);
    }

    #[test]
    fn pressure_is_clamped() {
        let over = TouchEvent::new(TouchAction::Move, 0, 0, 1, 1, 3.0).encode();
        assert_eq!(&over[22..24], &[0xff, 0xff]);
        let under = TouchEvent::new(TouchAction::Up, 0, 0, 1, 1, -1.0).encode();
        assert_eq!(&under[22..24], &[0, 0]);
        let nan = TouchEvent::new(TouchAction::Up, 0, 0, 1, 1, f32::NAN).encode();
        assert_eq!(&nan[22..24], &[0, 0]);
    }

    #[test]
    fn view_coordinates_scale_to_video() {
        let ev = TouchEvent::from_view(TouchAction::Down, 540.0, 1200.0, 1080.0, 2400.0, 720, 1600, 1.0);
        assert_eq!((ev.x, ev.y), (360, 800));
        assert_eq!((ev.width, ev.height), (720, 1600));

        let outside = TouchEvent::from_view(TouchAction::Move, -5.0, 9000.0, 1080.0, 2400.0, 720, 1600, 0.5);
        assert_eq!((outside.x, outside.y), (0, 1600));
    }

    #[test]
    fn decode_reads_back_fields() {
        let ev = TouchEvent::new(TouchAction::Up, 12, 34, 720, 1600, 0.0);
        let back = TouchEvent::decode(&ev.encode()).unwrap();
        assert_eq!(back.action, TouchAction::Up);
        assert_eq!((back.x, back.y), (12, 34));
        let mut bad = ev.encode();
        bad[0] = 9;
        assert!(TouchEvent::decode(&bad).is_err());
    }
}
