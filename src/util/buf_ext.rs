use anyhow::anyhow;


macro_rules! get_try_impl {
    ($try_getter: ident, $ty:ty, $getter: ident) => {
        fn $try_getter(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < std::mem::size_of::<$ty>() {
                return Err(anyhow!("buffer underflow"));
            }
            Ok(self.$getter())
        }
    }
}

/// Bounds-checked big-endian getters for decoding fixed-layout management datagrams.
pub trait BufExt: bytes::Buf {
    get_try_impl!(try_get_byte, u8, get_u8);
    get_try_impl!(try_get_u16_be, u16, get_u16);
    get_try_impl!(try_get_u32_be, u32, get_u32);
    get_try_impl!(try_get_u64_be, u64, get_u64);

    fn try_get_array<const N: usize>(&mut self) -> anyhow::Result<[u8; N]> {
        if self.remaining() < N {
            return Err(anyhow!("buffer underflow"));
        }
        let mut result = [0u8; N];
        self.copy_to_slice(&mut result);
        Ok(result)
    }

    fn try_skip(&mut self, len: usize) -> anyhow::Result<()> {
        if self.remaining() < len {
            return Err(anyhow!("buffer underflow"));
        }
        self.advance(len);
        Ok(())
    }
}

impl <T: bytes::Buf> BufExt for T {
}
