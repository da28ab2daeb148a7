use bitflags::bitflags;

bitflags! {
    /// Open modes. O_CREATE is additive; the access mode is the low bits.
    pub struct OpenFlags: i32 {
        const O_RDONLY = 0x0;
        const O_WRONLY = 0x1;
        const O_RDWR = 0x2;
        const O_CREATE = 0x200;
    }
}

impl OpenFlags {
    /// The access-mode bits alone.
    pub fn access_mode(self) -> i32 {
        self.bits() & 0x3
    }

    pub fn readable(self) -> bool {
        self.access_mode() != Self::O_WRONLY.bits()
    }

    pub fn writable(self) -> bool {
        let mode = self.access_mode();
        mode == Self::O_WRONLY.bits() || mode == Self::O_RDWR.bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_modes() {
        assert!(OpenFlags::O_RDONLY.readable() && !OpenFlags::O_RDONLY.writable());
        assert!(!OpenFlags::O_WRONLY.readable() && OpenFlags::O_WRONLY.writable());
        assert!(OpenFlags::O_RDWR.readable() && OpenFlags::O_RDWR.writable());

        let create_rw = OpenFlags::O_CREATE | OpenFlags::O_RDWR;
        assert!(create_rw.readable() && create_rw.writable());
        assert_eq!(create_rw.access_mode(), OpenFlags::O_RDWR.bits());
    }
}
